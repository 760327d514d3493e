// fkv-common - Wire framing and error types shared by the fkv crates
//
// This crate defines the length-prefixed frame format spoken with the store

pub mod codec;
pub mod error;

// Re-export for convenience
pub use codec::*;
pub use error::*;
