//! Authentication module for flexblock.
//!
//! IO on the data path is authorized by signed tokens only.

// Panics in token handling would take down a storage node.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod token;

pub use token::{IoToken, TokenSigner};
