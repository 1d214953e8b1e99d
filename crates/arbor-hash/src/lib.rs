//! Object identity for arbor.
//!
//! Provides the `ObjectId` content hash, the supported hash algorithms, hex
//! encoding/decoding, and streaming object hashing.

mod algorithm;
mod error;
pub mod hasher;
pub mod hex;
mod oid;

pub use algorithm::HashAlgorithm;
pub use error::HashError;
pub use oid::ObjectId;
