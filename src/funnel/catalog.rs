//! The life insurance quote funnel.
//!
//! Insurance questions come first, personal details after, consent before
//! quotes are shown. Phrasing switches to third person when the policy is
//! for someone else.

use super::answers::AnswerStore;
use super::graph::{ChoiceOption, DONE, InputKind, Message, Step, StepGraph};
use super::validate;
use crate::error::FunnelError;

pub const ENTRY_STEP: &str = "welcome";
pub const SUBMISSION_STEP: &str = "submitting";
pub const CONTACT_STEP: &str = "phone";
pub const VERIFY_STEP: &str = "phone_verify";

/// Term lengths offered, in years.
pub const TERM_LENGTHS: [u32; 5] = [10, 15, 20, 25, 30];
/// Term used when the term question is skipped.
pub const DEFAULT_TERM: u32 = 10;
/// Age at which a term must end.
const TERM_MAX_END_AGE: u32 = 85;

pub const CONSENT_TEXT: &str = "By checking this box, I agree to be contacted by a licensed \
insurance agent by phone, text or email at the number and address I provided, including by \
automated means, about life insurance quotes. Consent is not a condition of purchase.";

pub const QUOTE_FALLBACK: &str =
    "I had trouble looking up rates. Let me connect you with an agent who can help directly.";

fn is_for_self(answers: &AnswerStore) -> bool {
    !answers.is("for_whom", "other")
}

fn name(answers: &AnswerStore) -> &str {
    answers.get("name").unwrap_or("there")
}

/// Term options for the recorded age. Ten years is always available.
pub fn term_options(answers: &AnswerStore) -> Vec<ChoiceOption> {
    let age = answers.parse::<u32>("age");
    TERM_LENGTHS
        .iter()
        .filter(|&&t| t == DEFAULT_TERM || age.is_none_or(|a| a + t <= TERM_MAX_END_AGE))
        .map(|t| ChoiceOption::new(format!("{t} years"), t.to_string()))
        .collect()
}

/// Build the default funnel graph.
pub fn insurance_funnel(agent_phone: &str) -> Result<StepGraph, FunnelError> {
    let agent_phone = agent_phone.to_string();
    let agent_display = validate::format_phone(&agent_phone);

    let steps = vec![
        Step::new(
            "welcome",
            "Hi! I'm Melissa. I help dads like you find affordable life insurance so your family \
             is always protected. This takes about two minutes to complete. Ready to get started?",
            InputKind::SingleChoice,
        )
        .options([("Let's do it", "yes")])
        .next("for_whom"),
        Step::new(
            "for_whom",
            "Is this life insurance policy for you or for someone else?",
            InputKind::SingleChoice,
        )
        .options([("For me", "self"), ("For someone else", "other")])
        .next("gender"),
        Step::new(
            "gender",
            Message::computed(|a| {
                if is_for_self(a) {
                    "What's your gender? (This affects life insurance rates.)".to_string()
                } else {
                    "What's their gender? (This affects life insurance rates.)".to_string()
                }
            }),
            InputKind::SingleChoice,
        )
        .options([("Male", "male"), ("Female", "female")])
        .next("smoker"),
        Step::new(
            "smoker",
            Message::computed(|a| {
                if is_for_self(a) {
                    "Do you use any tobacco products?".to_string()
                } else {
                    "Do they use any tobacco products?".to_string()
                }
            }),
            InputKind::SingleChoice,
        )
        .options([
            ("No, never", "never"),
            ("I quit recently", "former"),
            ("Yes", "current"),
        ])
        .branch(|_, value| {
            if value == "current" {
                "smoker_note".to_string()
            } else {
                "health".to_string()
            }
        }),
        Step::new(
            "smoker_note",
            "No worries, I can still find options. Just know that tobacco use does impact rates. \
             Some carriers offer better rates for smokers than others, so it's still worth comparing.",
            InputKind::Auto,
        )
        .next("health"),
        Step::new(
            "health",
            Message::computed(|a| {
                if is_for_self(a) {
                    "How would you describe your overall health?".to_string()
                } else {
                    "How would you describe their overall health?".to_string()
                }
            }),
            InputKind::SingleChoice,
        )
        .options([
            ("Excellent", "preferred_plus"),
            ("Great", "preferred"),
            ("Good", "standard_plus"),
            ("Could be better", "standard"),
        ])
        .next("coverage"),
        Step::new(
            "coverage",
            "How much coverage are you looking for?",
            InputKind::SingleChoice,
        )
        .options([
            ("$250,000", "250000"),
            ("$500,000", "500000"),
            ("$750,000", "750000"),
            ("$1,000,000", "1000000"),
            ("$1,000,000+", "1500000"),
        ])
        .next("timing"),
        Step::new(
            "timing",
            "How soon are you wanting to get this policy started?",
            InputKind::SingleChoice,
        )
        .options([
            ("Right away", "right_away"),
            ("Within a month", "within_month"),
            ("In a few months", "few_months"),
            ("I'm not sure", "not_sure"),
        ])
        .next("name"),
        Step::new(
            "name",
            "Just a couple pieces of personal info so we can tailor this quote to you. \
             What's your first name?",
            InputKind::Text,
        )
        .validate(|v, _| validate::name(v))
        .next("email"),
        Step::new(
            "email",
            Message::computed(|a| format!("Perfect, {}! What's the best email to reach you?", name(a))),
            InputKind::Email,
        )
        .validate(|v, _| validate::email(v))
        .next(CONTACT_STEP),
        Step::new(
            CONTACT_STEP,
            "And what's the best phone number to reach you? We'll send a quick code to verify it.",
            InputKind::Phone,
        )
        .validate(|v, _| validate::phone(v))
        .next(VERIFY_STEP),
        Step::new(
            VERIFY_STEP,
            Message::computed(|a| {
                format!(
                    "I just sent a 6-digit code to {}. Please check your texts and enter it \
                     below to verify your number.",
                    validate::format_phone(a.get(CONTACT_STEP).unwrap_or_default())
                )
            }),
            InputKind::CodeVerification {
                contact_step: CONTACT_STEP.to_string(),
                code_length: 6,
                min_length: 4,
            },
        )
        .next("zip"),
        Step::new("zip", "What's your ZIP code?", InputKind::Text)
            .validate(|v, _| validate::zip(v))
            .next("age"),
        Step::new(
            "age",
            Message::computed(|a| {
                if is_for_self(a) {
                    "Almost done, how old are you?".to_string()
                } else {
                    "Almost done, how old are they?".to_string()
                }
            }),
            InputKind::Number,
        )
        .validate(|v, _| validate::age(v))
        .next("term"),
        Step::new(
            "term",
            "How many years would you like the coverage to last?",
            InputKind::SingleChoice,
        )
        .computed_options(term_options)
        .skip_if(|a| term_options(a).len() <= 1)
        .next("consent"),
        Step::new(
            "consent",
            Message::computed(|a| {
                format!(
                    "All set, {}. I have some quotes ready for you. Before I can show them, \
                     please confirm the following:",
                    name(a)
                )
            }),
            InputKind::Consent {
                disclosure: CONSENT_TEXT.to_string(),
            },
        )
        .branch(|_, value| {
            if value == "decline" {
                "soft_decline".to_string()
            } else {
                "calculating".to_string()
            }
        }),
        Step::new(
            "soft_decline",
            Message::computed(|a| {
                format!(
                    "No problem at all, {}! When you're ready to protect your family, just come \
                     back anytime.",
                    name(a)
                )
            }),
            InputKind::Auto,
        )
        .next(DONE),
        Step::new(
            "calculating",
            Message::computed(|a| format!("One moment, {}. Let me crunch the numbers...", name(a))),
            InputKind::Auto,
        )
        .next("rates_display"),
        Step::new(
            "rates_display",
            Message::computed(|a| {
                format!(
                    "Here's what I found for you, {}. These are estimated monthly rates from \
                     top-rated carriers:",
                    name(a)
                )
            }),
            InputKind::ResultDisplay,
        )
        .next(SUBMISSION_STEP),
        Step::new(
            SUBMISSION_STEP,
            "I'm saving your quote so an agent can lock it in for you.",
            InputKind::Auto,
        )
        .next("lock_in"),
        Step::new(
            "lock_in",
            Message::computed(move |a| {
                format!(
                    "{}, if you want to lock in this rate, you can speak to a representative \
                     right now. Just tap {} and we can connect you right away.",
                    name(a),
                    agent_display
                )
            }),
            InputKind::ExternalAction {
                label: "Call now".to_string(),
                target: format!("tel:{agent_phone}"),
            },
        )
        .next(DONE),
    ];

    StepGraph::new(ENTRY_STEP, steps, Some(SUBMISSION_STEP))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> StepGraph {
        insurance_funnel("8005551234").unwrap()
    }

    #[test]
    fn funnel_is_well_formed() {
        let g = graph();
        assert_eq!(g.entry(), "welcome");
        assert!(g.is_submission_trigger("submitting"));
        // Auto steps, the result display and the call-to-action are not counted.
        assert_eq!(g.progress_total(), g.len() - 6);
    }

    #[test]
    fn smoker_branching() {
        let g = graph();
        let smoker = g.step("smoker").unwrap();
        let answers = AnswerStore::from_pairs([("for_whom", "self"), ("gender", "male")]);
        assert_eq!(smoker.resolve_next(&answers, "never"), "health");
        assert_eq!(smoker.resolve_next(&answers, "former"), "health");
        assert_eq!(smoker.resolve_next(&answers, "current"), "smoker_note");
    }

    #[test]
    fn third_person_phrasing() {
        let g = graph();
        let me = AnswerStore::from_pairs([("for_whom", "self")]);
        let them = AnswerStore::from_pairs([("for_whom", "other")]);
        let gender = g.step("gender").unwrap();
        assert!(gender.resolve_message(&me).contains("your gender"));
        assert!(gender.resolve_message(&them).contains("their gender"));
        let health = g.step("health").unwrap();
        assert!(health.resolve_message(&them).contains("their overall health"));
    }

    #[test]
    fn term_options_bounded_by_age() {
        let young = AnswerStore::from_pairs([("age", "35")]);
        let values: Vec<String> = term_options(&young).into_iter().map(|o| o.value).collect();
        assert_eq!(values, vec!["10", "15", "20", "25", "30"]);

        let older = AnswerStore::from_pairs([("age", "62")]);
        let values: Vec<String> = term_options(&older).into_iter().map(|o| o.value).collect();
        assert_eq!(values, vec!["10", "15", "20"]);

        let senior = AnswerStore::from_pairs([("age", "80")]);
        assert_eq!(term_options(&senior).len(), 1);
        assert!(graph().step("term").unwrap().should_skip(&senior));
        assert!(!graph().step("term").unwrap().should_skip(&older));
    }

    #[test]
    fn verification_message_formats_phone() {
        let g = graph();
        let answers = AnswerStore::from_pairs([("phone", "5559991234")]);
        let msg = g.step(VERIFY_STEP).unwrap().resolve_message(&answers);
        assert!(msg.contains("I just sent a 6-digit code to (555) 999-1234"));
    }

    #[test]
    fn consent_decline_branches_to_soft_decline() {
        let g = graph();
        let consent = g.step("consent").unwrap();
        let answers = AnswerStore::new();
        assert_eq!(consent.resolve_next(&answers, "decline"), "soft_decline");
        assert_eq!(consent.resolve_next(&answers, "true"), "calculating");
    }
}
