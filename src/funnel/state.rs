//! Session phase machine and the transcript/event types a session emits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::ChoiceOption;
use crate::services::quotes::CarrierQuote;

/// Where a session is in its reveal cycle.
///
/// `NotStarted → Revealing → (AwaitingInput ↔ Revealing)* → Done`. This is
/// the single source of truth for whether user input is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    NotStarted,
    /// A delay or outbound call is in flight before the next message shows.
    Revealing,
    /// A message is visible and the session waits for one qualifying action.
    AwaitingInput,
    Done,
}

impl SessionPhase {
    pub fn can_transition_to(&self, target: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, target),
            (NotStarted, Revealing)
                | (NotStarted, Done)
                | (Revealing, AwaitingInput)
                | (Revealing, Done)
                | (AwaitingInput, Revealing)
                | (AwaitingInput, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Revealing => "revealing",
            Self::AwaitingInput => "awaiting_input",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Who said it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Bot,
    User,
}

/// One line of the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    /// Step this entry belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Input kind tag of the step, for bot prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ChoiceOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<CarrierQuote>,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: Sender::Bot,
            text: text.into(),
            step_id: None,
            input: None,
            options: Vec::new(),
            quotes: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            ..Self::bot(text)
        }
    }

    pub fn for_step(mut self, step_id: &str, input: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self.input = Some(input.to_string());
        self
    }

    pub fn with_options(mut self, options: Vec<ChoiceOption>) -> Self {
        self.options = options;
        self
    }

    pub fn with_quotes(mut self, quotes: Vec<CarrierQuote>) -> Self {
        self.quotes = quotes;
        self
    }
}

/// Progress bar state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Events broadcast to anyone watching a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FunnelEvent {
    /// The bot is "typing" the message for `step_id`.
    Typing { step_id: String },
    Message { entry: TranscriptEntry },
    /// The session now waits for input on `step_id`.
    AwaitingInput { step_id: String, progress: Progress },
    Completed { lead_id: Option<Uuid> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use SessionPhase::*;
        for (from, to) in [
            (NotStarted, Revealing),
            (Revealing, AwaitingInput),
            (AwaitingInput, Revealing),
            (Revealing, Done),
            (AwaitingInput, Done),
        ] {
            assert!(from.can_transition_to(to), "{from} should transition to {to}");
        }
    }

    #[test]
    fn invalid_transitions() {
        use SessionPhase::*;
        assert!(!Done.can_transition_to(Revealing));
        assert!(!Done.can_transition_to(AwaitingInput));
        assert!(!AwaitingInput.can_transition_to(AwaitingInput));
        assert!(!NotStarted.can_transition_to(AwaitingInput));
    }

    #[test]
    fn display_matches_serde() {
        use SessionPhase::*;
        for phase in [NotStarted, Revealing, AwaitingInput, Done] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(format!("\"{phase}\""), json);
        }
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = FunnelEvent::Typing {
            step_id: "gender".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["step_id"], "gender");
    }

    #[test]
    fn user_entry_keeps_text() {
        let entry = TranscriptEntry::user("Male");
        assert_eq!(entry.sender, Sender::User);
        assert_eq!(entry.text, "Male");
        assert!(entry.options.is_empty());
    }
}
