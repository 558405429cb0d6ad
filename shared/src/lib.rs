// shared/src/lib.rs

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Failures the error-tolerance policy may swallow.
    /// Configuration mistakes and cache misses are never in this set.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_) | Error::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-to-live in whole seconds. Zero means every item is already expired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TtlSecs(pub u64);

impl TtlSecs {
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

pub mod config;
