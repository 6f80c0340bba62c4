//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for broker credentials.

pub use secrecy::{ExposeSecret, SecretString};
