pub mod auth;
pub mod channel_state;
pub mod commands;
pub mod config;
pub mod egress;
pub mod error;
pub mod filter;
pub mod generator;
pub mod irc_adapter;
pub mod models;
pub mod processor;
pub mod store;
pub mod supervisor;
pub mod telemetry;
