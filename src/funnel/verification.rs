//! Verification sub-flow state and the local code-entry gate.

use serde::{Deserialize, Serialize};

use super::validate::digits;

/// `NotSent → AwaitingEntry → Verified`; change-channel resets to `NotSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    #[default]
    NotSent,
    AwaitingEntry,
    Verified,
}

impl VerificationState {
    pub fn can_transition_to(&self, target: VerificationState) -> bool {
        use VerificationState::*;
        matches!(
            (self, target),
            (NotSent, AwaitingEntry)
                | (AwaitingEntry, AwaitingEntry)
                | (AwaitingEntry, Verified)
                | (AwaitingEntry, NotSent)
        )
    }
}

/// Outcome of the local gate on a typed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeEntry {
    /// Digits ready to send to the verification service.
    Ready(String),
    TooShort,
    TooLong,
}

/// Strip everything but digits and check the length bounds. Only the
/// external service decides whether the code is correct.
pub fn gate_code(raw: &str, min_length: usize, code_length: usize) -> CodeEntry {
    let code = digits(raw);
    if code.len() < min_length {
        CodeEntry::TooShort
    } else if code.len() > code_length {
        CodeEntry::TooLong
    } else {
        CodeEntry::Ready(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_strips_non_digits() {
        assert_eq!(gate_code("abc123def456", 4, 6), CodeEntry::Ready("123456".to_string()));
    }

    #[test]
    fn gate_enforces_bounds() {
        assert_eq!(gate_code("12", 4, 6), CodeEntry::TooShort);
        assert_eq!(gate_code("1234", 4, 6), CodeEntry::Ready("1234".to_string()));
        assert_eq!(gate_code("1234567", 4, 6), CodeEntry::TooLong);
    }

    #[test]
    fn transitions() {
        use VerificationState::*;
        assert!(NotSent.can_transition_to(AwaitingEntry));
        assert!(AwaitingEntry.can_transition_to(Verified));
        assert!(AwaitingEntry.can_transition_to(NotSent));
        assert!(!Verified.can_transition_to(AwaitingEntry));
        assert!(!NotSent.can_transition_to(Verified));
    }
}
