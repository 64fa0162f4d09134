// Contract-violation errors shared by the tokenizer, scorer and planner adapter.
//
// Tensor code returns anyhow::Result like the rest of the crate; these kinds are
// raised through it and recovered by callers with `downcast_ref::<ZeroError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZeroError {
    /// A sequence is longer than the configured bound. The planner should treat
    /// the branch as not expandable further.
    #[error("sequence too long: {len} > {max_len}")]
    LengthExceeded { len: usize, max_len: usize },

    #[error("recurrent inference called before initial inference cached an observation")]
    NotInitialized,

    #[error("batch mismatch: {what} has {got} rows, expected {expected}")]
    BatchMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("row {row} has no valid positions")]
    EmptySequence { row: usize },

    #[error("malformed SELFIES at byte {at}: {reason}")]
    MalformedSelfies { at: usize, reason: String },

    #[error("vocabulary mismatch: expected checksum {expected}, found {found}")]
    VocabMismatch { expected: String, found: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// True if `err` carries a [`ZeroError::LengthExceeded`].
pub fn is_length_exceeded(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ZeroError>(),
        Some(ZeroError::LengthExceeded { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_exceeded_message() {
        let err = ZeroError::LengthExceeded { len: 9, max_len: 8 };
        assert_eq!(err.to_string(), "sequence too long: 9 > 8");
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ZeroError::LengthExceeded { len: 3, max_len: 2 }.into();
        assert!(is_length_exceeded(&err));

        let other: anyhow::Error = ZeroError::NotInitialized.into();
        assert!(!is_length_exceeded(&other));
        assert_eq!(other.downcast_ref::<ZeroError>(), Some(&ZeroError::NotInitialized));
    }
}
