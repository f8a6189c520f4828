//! Step graph model. Steps are declarative: message, options and next step
//! are either fixed values or pure functions of the answers so far.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::answers::AnswerStore;
use crate::error::FunnelError;

/// Terminal step id.
pub const DONE: &str = "done";

pub type MessageFn = Arc<dyn Fn(&AnswerStore) -> String + Send + Sync>;
pub type OptionsFn = Arc<dyn Fn(&AnswerStore) -> Vec<ChoiceOption> + Send + Sync>;
pub type NextFn = Arc<dyn Fn(&AnswerStore, &str) -> String + Send + Sync>;
pub type Validator = Arc<dyn Fn(&str, &AnswerStore) -> Option<String> + Send + Sync>;
pub type SkipRule = Arc<dyn Fn(&AnswerStore) -> bool + Send + Sync>;

/// A step's message text.
#[derive(Clone)]
pub enum Message {
    Fixed(String),
    Computed(MessageFn),
}

impl Message {
    pub fn computed(f: impl Fn(&AnswerStore) -> String + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub fn resolve(&self, answers: &AnswerStore) -> String {
        match self {
            Self::Fixed(text) => text.clone(),
            Self::Computed(f) => f(answers),
        }
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Fixed(text.to_string())
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Fixed(text)
    }
}

/// One selectable option of a single-choice step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub label: String,
    pub value: String,
}

impl ChoiceOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Options for a single-choice step.
#[derive(Clone)]
pub enum Options {
    Fixed(Vec<ChoiceOption>),
    Computed(OptionsFn),
}

impl Options {
    pub fn resolve(&self, answers: &AnswerStore) -> Vec<ChoiceOption> {
        match self {
            Self::Fixed(options) => options.clone(),
            Self::Computed(f) => f(answers),
        }
    }
}

/// Where a step goes once it completes.
#[derive(Clone)]
pub enum Next {
    Fixed(String),
    Computed(NextFn),
}

impl Next {
    pub fn resolve(&self, answers: &AnswerStore, value: &str) -> String {
        match self {
            Self::Fixed(id) => id.clone(),
            Self::Computed(f) => f(answers, value),
        }
    }
}

/// What kind of input a step waits for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    /// No input; the driver advances after a delay.
    Auto,
    SingleChoice,
    Text,
    Number,
    Email,
    Phone,
    /// Boolean affirmation of a disclosure; the disclosure is recorded too.
    Consent { disclosure: String },
    /// Runs the quote lookup and shows the result, then advances.
    ResultDisplay,
    /// Hands off to something outside the funnel, e.g. a click-to-call link.
    ExternalAction { label: String, target: String },
    /// One-time code check against the contact collected at `contact_step`.
    CodeVerification {
        contact_step: String,
        code_length: usize,
        min_length: usize,
    },
}

impl InputKind {
    /// Free-text kinds, the only ones that carry a `validate` function.
    pub fn is_free_text(&self) -> bool {
        matches!(self, Self::Text | Self::Number | Self::Email | Self::Phone)
    }

    /// Whether the driver stops and waits for the user at this step.
    /// An external action is shown and then left to the user outside the
    /// funnel, so it does not wait.
    pub fn awaits_input(&self) -> bool {
        !matches!(
            self,
            Self::Auto | Self::ResultDisplay | Self::ExternalAction { .. }
        )
    }

    /// Short tag used in transcripts and logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::SingleChoice => "single_choice",
            Self::Text => "text",
            Self::Number => "number",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Consent { .. } => "consent",
            Self::ResultDisplay => "result_display",
            Self::ExternalAction { .. } => "external_action",
            Self::CodeVerification { .. } => "code_verification",
        }
    }
}

/// A single step in the funnel.
#[derive(Clone)]
pub struct Step {
    pub id: String,
    pub message: Message,
    pub input: InputKind,
    pub options: Option<Options>,
    pub validate: Option<Validator>,
    pub next: Next,
    pub skip_if: Option<SkipRule>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("has_options", &self.options.is_some())
            .field("has_validate", &self.validate.is_some())
            .field("has_skip_if", &self.skip_if.is_some())
            .finish()
    }
}

impl Step {
    /// A step with a fixed next of `done`; chain the builders to fill it in.
    pub fn new(id: impl Into<String>, message: impl Into<Message>, input: InputKind) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            input,
            options: None,
            validate: None,
            next: Next::Fixed(DONE.to_string()),
            skip_if: None,
        }
    }

    pub fn options<I>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        self.options = Some(Options::Fixed(
            options
                .into_iter()
                .map(|(label, value)| ChoiceOption::new(label, value))
                .collect(),
        ));
        self
    }

    pub fn computed_options(
        mut self,
        f: impl Fn(&AnswerStore) -> Vec<ChoiceOption> + Send + Sync + 'static,
    ) -> Self {
        self.options = Some(Options::Computed(Arc::new(f)));
        self
    }

    pub fn validate(
        mut self,
        f: impl Fn(&str, &AnswerStore) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(f));
        self
    }

    pub fn next(mut self, id: impl Into<String>) -> Self {
        self.next = Next::Fixed(id.into());
        self
    }

    pub fn branch(mut self, f: impl Fn(&AnswerStore, &str) -> String + Send + Sync + 'static) -> Self {
        self.next = Next::Computed(Arc::new(f));
        self
    }

    pub fn skip_if(mut self, f: impl Fn(&AnswerStore) -> bool + Send + Sync + 'static) -> Self {
        self.skip_if = Some(Arc::new(f));
        self
    }

    pub fn resolve_message(&self, answers: &AnswerStore) -> String {
        self.message.resolve(answers)
    }

    /// Options for a single-choice step; empty for every other kind.
    pub fn resolve_options(&self, answers: &AnswerStore) -> Vec<ChoiceOption> {
        self.options
            .as_ref()
            .map(|o| o.resolve(answers))
            .unwrap_or_default()
    }

    pub fn resolve_next(&self, answers: &AnswerStore, value: &str) -> String {
        self.next.resolve(answers, value)
    }

    pub fn should_skip(&self, answers: &AnswerStore) -> bool {
        self.skip_if.as_ref().is_some_and(|f| f(answers))
    }

    /// Run the step's validator. Only free-text steps are validated here.
    pub fn check(&self, value: &str, answers: &AnswerStore) -> Option<String> {
        if !self.input.is_free_text() {
            return None;
        }
        self.validate.as_ref().and_then(|f| f(value, answers))
    }
}

/// A validated funnel graph.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: IndexMap<String, Step>,
    entry: String,
    submission_step: Option<String>,
}

impl StepGraph {
    /// Build and validate a graph.
    ///
    /// Validation catches the structural faults that are knowable without
    /// running the computed functions: duplicate ids, a missing entry,
    /// fixed edges into nowhere, empty fixed option lists and cycles of
    /// steps that never wait for input.
    pub fn new(
        entry: impl Into<String>,
        steps: Vec<Step>,
        submission_step: Option<&str>,
    ) -> Result<Self, FunnelError> {
        let entry = entry.into();
        let mut map = IndexMap::new();
        for step in steps {
            if map.contains_key(&step.id) {
                return Err(FunnelError::DuplicateStep(step.id));
            }
            map.insert(step.id.clone(), step);
        }

        let graph = Self {
            steps: map,
            entry,
            submission_step: submission_step.map(str::to_string),
        };
        graph.check()?;
        Ok(graph)
    }

    fn check(&self) -> Result<(), FunnelError> {
        if !self.steps.contains_key(&self.entry) {
            return Err(FunnelError::MissingEntry(self.entry.clone()));
        }

        for step in self.steps.values() {
            if let Next::Fixed(to) = &step.next
                && !self.is_known(to)
            {
                return Err(FunnelError::DanglingEdge {
                    from: step.id.clone(),
                    to: to.clone(),
                });
            }

            match (&step.input, &step.options) {
                (InputKind::SingleChoice, None) => {
                    return Err(FunnelError::EmptyOptions(step.id.clone()));
                }
                (InputKind::SingleChoice, Some(Options::Fixed(options))) if options.is_empty() => {
                    return Err(FunnelError::EmptyOptions(step.id.clone()));
                }
                (InputKind::CodeVerification { contact_step, .. }, _)
                    if !self.steps.contains_key(contact_step) =>
                {
                    return Err(FunnelError::UnknownContactStep {
                        step: step.id.clone(),
                        contact: contact_step.clone(),
                    });
                }
                _ => {}
            }
        }

        if let Some(trigger) = &self.submission_step
            && !self.steps.contains_key(trigger)
        {
            return Err(FunnelError::DanglingEdge {
                from: "<submission>".to_string(),
                to: trigger.clone(),
            });
        }

        self.check_inputless_cycles()
    }

    /// Follow fixed edges out of every step that does not wait for input and
    /// fail if the walk comes back around.
    fn check_inputless_cycles(&self) -> Result<(), FunnelError> {
        for start in self.steps.values().filter(|s| !s.input.awaits_input()) {
            let mut seen = HashSet::new();
            let mut path = Vec::new();
            let mut current = start;
            loop {
                if !seen.insert(current.id.as_str()) {
                    return Err(FunnelError::InputlessCycle(path));
                }
                path.push(current.id.clone());
                let Next::Fixed(to) = &current.next else { break };
                match self.steps.get(to) {
                    Some(next) if !next.input.awaits_input() => current = next,
                    _ => break,
                }
            }
        }
        Ok(())
    }

    fn is_known(&self, id: &str) -> bool {
        id == DONE || self.steps.contains_key(id)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether reaching `step_id` should submit the lead.
    pub fn is_submission_trigger(&self, step_id: &str) -> bool {
        self.submission_step.as_deref() == Some(step_id)
    }

    /// Upper bound on steps visited by one advance without user input.
    pub fn hop_limit(&self) -> usize {
        self.steps.len() + 1
    }

    /// Number of steps shown on the progress bar.
    pub fn progress_total(&self) -> usize {
        self.steps.values().filter(|s| s.input.awaits_input()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choice(id: &str, next: &str) -> Step {
        Step::new(id, "pick", InputKind::SingleChoice)
            .options([("Yes", "yes")])
            .next(next)
    }

    #[test]
    fn fixed_and_computed_message_resolve() {
        let answers = AnswerStore::from_pairs([("name", "Dana")]);
        let fixed = Message::from("hello");
        let computed = Message::computed(|a| format!("hi {}", a.get("name").unwrap_or("")));
        assert_eq!(fixed.resolve(&answers), "hello");
        assert_eq!(computed.resolve(&answers), "hi Dana");
        // Referentially transparent.
        assert_eq!(computed.resolve(&answers), computed.resolve(&answers));
    }

    #[test]
    fn branch_uses_value() {
        let step = choice("smoker", "health").branch(|_, v| {
            if v == "current" { "smoker_note".into() } else { "health".into() }
        });
        let answers = AnswerStore::new();
        assert_eq!(step.resolve_next(&answers, "current"), "smoker_note");
        assert_eq!(step.resolve_next(&answers, "never"), "health");
    }

    #[test]
    fn validator_only_applies_to_free_text() {
        let text = Step::new("name", "name?", InputKind::Text)
            .validate(|v, _| v.is_empty().then(|| "required".to_string()));
        let choice = Step::new("c", "c?", InputKind::SingleChoice)
            .options([("A", "a")])
            .validate(|_, _| Some("never".to_string()));
        let answers = AnswerStore::new();
        assert_eq!(text.check("", &answers), Some("required".to_string()));
        assert_eq!(text.check("x", &answers), None);
        assert_eq!(choice.check("a", &answers), None);
    }

    #[test]
    fn graph_rejects_missing_entry() {
        let err = StepGraph::new("start", vec![choice("a", DONE)], None).unwrap_err();
        assert!(matches!(err, FunnelError::MissingEntry(_)));
    }

    #[test]
    fn graph_rejects_dangling_fixed_edge() {
        let err = StepGraph::new("a", vec![choice("a", "nowhere")], None).unwrap_err();
        assert!(matches!(err, FunnelError::DanglingEdge { .. }));
    }

    #[test]
    fn graph_rejects_duplicate_ids() {
        let err = StepGraph::new("a", vec![choice("a", DONE), choice("a", DONE)], None).unwrap_err();
        assert!(matches!(err, FunnelError::DuplicateStep(_)));
    }

    #[test]
    fn graph_rejects_choice_without_options() {
        let step = Step::new("a", "?", InputKind::SingleChoice);
        let err = StepGraph::new("a", vec![step], None).unwrap_err();
        assert!(matches!(err, FunnelError::EmptyOptions(_)));
    }

    #[test]
    fn graph_rejects_auto_cycle() {
        let steps = vec![
            choice("start", "a"),
            Step::new("a", "a", InputKind::Auto).next("b"),
            Step::new("b", "b", InputKind::Auto).next("a"),
        ];
        let err = StepGraph::new("start", steps, None).unwrap_err();
        assert!(matches!(err, FunnelError::InputlessCycle(_)));
    }

    #[test]
    fn graph_accepts_cycle_through_input_step() {
        let steps = vec![
            choice("start", "a"),
            Step::new("a", "a", InputKind::Auto).next("start"),
        ];
        assert!(StepGraph::new("start", steps, None).is_ok());
    }

    #[test]
    fn progress_total_excludes_auto_and_results() {
        let steps = vec![
            choice("a", "b"),
            Step::new("b", "b", InputKind::Auto).next("c"),
            Step::new("c", "c", InputKind::ResultDisplay).next("d"),
            Step::new("d", "d", InputKind::Text).next(DONE),
        ];
        let graph = StepGraph::new("a", steps, Some("b")).unwrap();
        assert_eq!(graph.progress_total(), 2);
        assert!(graph.is_submission_trigger("b"));
        assert!(!graph.is_submission_trigger("a"));
    }
}
