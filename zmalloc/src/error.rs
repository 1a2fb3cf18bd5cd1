//! Error types for allocator setup paths. The hot allocate/deallocate API
//! itself stays pointer-based (null on failure); these are for the ambient
//! configuration surface around it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("requested alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("requested size {0} overflows when rounded up to its size class")]
    SizeOverflow(usize),
}
