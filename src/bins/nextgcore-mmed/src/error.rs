//! MME Errors
//!
//! Each component reports its own error enum; `MmeError` aggregates them for
//! the event loop, which stops only on fatal errors.

use thiserror::Error;

use crate::association::AssociationError;
use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::mobility::MobilityError;
use crate::session::SessionError;
use crate::tft::TftError;

/// Top-level MME error
#[derive(Error, Debug)]
pub enum MmeError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("association: {0}")]
    Association(#[from] AssociationError),
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("traffic flow template: {0}")]
    Tft(#[from] TftError),
    #[error("mobility: {0}")]
    Mobility(#[from] MobilityError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl MmeError {
    /// Invariant violations that must stop the MME task
    pub fn is_fatal(&self) -> bool {
        match self {
            MmeError::Session(e) => e.is_fatal(),
            MmeError::Mobility(e) => e.is_fatal(),
            MmeError::Internal(_) => true,
            _ => false,
        }
    }
}

/// MME result type
pub type MmeResult<T> = Result<T, MmeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(MmeError::Internal("slot".into()).is_fatal());
        assert!(MmeError::from(SessionError::PoolCorrupted("bearer 5".into())).is_fatal());
        assert!(!MmeError::from(SessionError::PoolExhausted).is_fatal());
        assert!(!MmeError::from(ConnectionError::UnknownCoreId(42)).is_fatal());
        assert!(MmeError::from(MobilityError::Session(SessionError::PoolCorrupted("x".into()))).is_fatal());
    }
}
