//! Outbound HTTP job dispatching and a client for the UPS monitoring daemon
//! (upsd) line protocol.
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod line_reader;
pub mod parser;
pub mod types;
pub mod upsd;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;
