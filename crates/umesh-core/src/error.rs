//! Error taxonomy shared by every mesh component
//!
//! The protocol engine never panics on input. Handlers return a
//! [`MeshResult`] and the caller decides whether the condition is
//! transient (`Busy`, `AddressQuery`) or final (`Drop`, `Fail`, `Parse`).

use thiserror::Error;

/// Errors produced by the mesh engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MeshError {
    /// Generic failure, the operation was rejected
    #[error("operation failed")]
    Fail,
    /// Message buffer budget exhausted
    #[error("out of message memory")]
    Mem,
    /// Frame or message dropped by policy
    #[error("message dropped")]
    Drop,
    /// A single-instance context (attach, auth) is already in use
    #[error("busy")]
    Busy,
    /// Destination unresolved, message parked until the query completes
    #[error("address query in progress")]
    AddressQuery,
    /// Malformed wire data
    #[error("parse error: {0}")]
    Parse(&'static str),
    /// Buffer too small for the requested encode
    #[error("buffer too small")]
    Buffer,
}

impl MeshError {
    /// True for conditions where the caller may retry later
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshError::Busy | MeshError::AddressQuery)
    }
}

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(MeshError::Busy.is_transient());
        assert!(MeshError::AddressQuery.is_transient());
        assert!(!MeshError::Drop.is_transient());
        assert!(!MeshError::Parse("short").is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(MeshError::Parse("tlv").to_string(), "parse error: tlv");
        assert_eq!(MeshError::Mem.to_string(), "out of message memory");
    }
}
