//! Conversational funnel: step graph, answers and the session driver.

pub mod answers;
pub mod catalog;
pub mod graph;
pub mod session;
pub mod state;
pub mod validate;
pub mod verification;

pub use answers::AnswerStore;
pub use graph::{ChoiceOption, InputKind, Step, StepGraph};
pub use session::{ActionOutcome, FunnelDeps, FunnelSession, SessionCloser, SessionSnapshot};
pub use state::{FunnelEvent, Progress, SessionPhase, TranscriptEntry};
pub use verification::VerificationState;
