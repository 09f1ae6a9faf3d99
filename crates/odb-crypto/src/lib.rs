//! Hash primitives for the object database.
//!
//! Object identifiers are the hash of an object's canonical encoding. This
//! crate wraps the SHA-1 and SHA-256 implementations behind a single
//! format-selected hasher; there is no custom cryptography here.

pub mod hasher;

pub use hasher::ObjectHasher;
