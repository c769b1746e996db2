pub mod defs;
pub mod error;

pub use defs::*;
pub use error::{DigestError, Result};
