//! Typed errors for each component boundary (spec §9: exception-driven
//! control flow replaced by an explicit result discriminant on every
//! fallible operation — `ok | blocked | unavailable | invalid |
//! duplicate`, realized here as `AppendOutcome`, `Verdict`, and the
//! per-component error enums below rather than one shared generic type).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate message_id")]
    Duplicate,
    #[error("store schema migration failed: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    #[error("generator produced invalid output")]
    Invalid,
    #[error("default model {0:?} missing from catalog {1:?}")]
    StartupFatal(String, Vec<String>),
}

#[derive(Debug, Error)]
pub enum IrcError {
    #[error("irc transport error: {0}")]
    Transport(String),
    #[error("banned from channel {0}")]
    Banned(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth material missing")]
    Missing,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("encryption key required for networked store")]
    KeyRequired,
    #[error("encryption error: {0}")]
    Crypto(String),
}

/// Top-level error for startup-fatal conditions (spec §7: `startup_fatal`).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),
    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),
    #[error("irc error: {0}")]
    Irc(#[from] IrcError),
    #[error("configuration error: {0}")]
    Config(String),
}
