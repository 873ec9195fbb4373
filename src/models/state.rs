//! Work record lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a work record.
///
/// A record is in exactly one state at a time; state transitions performed
/// by the store are the only source of truth for ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Available for claim (possibly delayed via `process_after`).
    Queued,
    /// Claimed by exactly one worker, which owns all further mutation.
    Processing,
    /// Failed retryably; becomes claimable again after the retry-after delay.
    Errored,
    /// Failed terminally.
    Failed,
    /// Finished successfully.
    Completed,
    /// Canceled cooperatively while processing.
    Canceled,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "errored" => Some(Self::Errored),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether the record can never be dequeued again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Completed | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for state in [
            RecordState::Queued,
            RecordState::Processing,
            RecordState::Errored,
            RecordState::Failed,
            RecordState::Completed,
            RecordState::Canceled,
        ] {
            assert_eq!(RecordState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(RecordState::from_str("bogus"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RecordState::Queued.is_terminal());
        assert!(!RecordState::Processing.is_terminal());
        assert!(!RecordState::Errored.is_terminal());
        assert!(RecordState::Failed.is_terminal());
        assert!(RecordState::Completed.is_terminal());
        assert!(RecordState::Canceled.is_terminal());
    }
}
