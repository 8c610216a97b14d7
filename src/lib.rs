//! Relay coordination and event protocol engine for a Nostr long-form
//! publishing client: key codecs, event signing and verification, bounded
//! relay fan-out with backoff, and comment and engagement aggregation.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod comments;
pub mod config;
pub mod engagement;
pub mod error;
pub mod event;
pub mod indexer;
pub mod keys;
pub mod relay;
pub mod signer;
pub mod store;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
