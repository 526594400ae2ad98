//! Core traits, keys, codec, constants, and error types.

pub mod codec;
pub mod constants;
mod error;
mod key;
mod traits;

pub use error::*;
pub use key::*;
pub use traits::*;
