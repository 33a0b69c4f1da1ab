//! Outbound-send abstraction (spec §9 design notes).
//!
//! The Command Handler needs to send confirmation/error lines to chat
//! but must never hold a reference back to the Processor that owns it.
//! `Egress` is the seam: the Processor constructs one concrete egress
//! per channel and hands it to the Command Handler as a trait object.

use async_trait::async_trait;

/// Sends raw text to a single channel. Implementors enforce the
/// outbound limit (500 bytes, no newlines, no formatting markers) at
/// the IRC adapter boundary, not here — the Command Handler's output is
/// operator text, not generated content, and is not run through the
/// content Filter (spec §4.E).
#[async_trait]
pub trait Egress: Send + Sync {
    async fn send(&self, channel: &str, text: &str);
}
