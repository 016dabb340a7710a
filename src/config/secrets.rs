//! Secret handling utilities.
//!
//! Re-exports the secrecy types the config and binary need to read
//! connection strings without logging them.

pub use secrecy::{ExposeSecret, SecretString};
