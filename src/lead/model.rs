//! Lead record types and the projection from funnel answers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LeadError;
use crate::funnel::AnswerStore;
use crate::funnel::catalog::DEFAULT_TERM;
use crate::funnel::validate;
use crate::services::quotes::CarrierQuote;

/// Closed set of answer values with a stable wire string per variant.
macro_rules! answer_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $value)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{other}'", stringify!($name))),
                }
            }
        }
    };
}

answer_enum!(Gender {
    Male => "male",
    Female => "female",
});

answer_enum!(SmokerStatus {
    Never => "never",
    Former => "former",
    Current => "current",
});

answer_enum!(
    /// Underwriting class as self-reported.
    HealthClass {
        PreferredPlus => "preferred_plus",
        Preferred => "preferred",
        StandardPlus => "standard_plus",
        Standard => "standard",
    }
);

answer_enum!(
    /// Who the policy is for.
    CoverageFor {
        Myself => "self",
        SomeoneElse => "other",
    }
);

answer_enum!(LeadStatus {
    New => "new",
    Delivered => "delivered",
    DeliveryFailed => "delivery_failed",
});

answer_enum!(
    /// Outcome of one delivery channel for a lead.
    ChannelStatus {
        Pending => "pending",
        Delivered => "delivered",
        Skipped => "skipped",
        Failed => "failed",
    }
);

/// Marketing attribution captured when the session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gclid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fbclid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landing_page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// The captured profile. This is also the body accepted by direct lead
/// ingest and the shape forwarded to the webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadProfile {
    pub age: u32,
    pub gender: Gender,
    pub smoker_status: SmokerStatus,
    pub health_class: HealthClass,
    pub coverage_amount: u64,
    pub term_length: u32,
    #[serde(default)]
    pub rates_shown: Vec<CarrierQuote>,

    pub first_name: String,
    pub email: String,
    pub phone: String,
    pub zip: String,

    pub consent_given: bool,
    #[serde(default)]
    pub consent_text: String,

    #[serde(flatten)]
    pub attribution: Attribution,
}

impl LeadProfile {
    /// Run the same field checks the funnel applies to typed input.
    pub fn validate(&self) -> Result<(), LeadError> {
        let checks = [
            ("firstName", self.first_name.clone(), validate::name(&self.first_name)),
            ("email", self.email.clone(), validate::email(&self.email)),
            ("phone", self.phone.clone(), validate::phone(&self.phone)),
            ("zip", self.zip.clone(), validate::zip(&self.zip)),
            ("age", self.age.to_string(), validate::age(&self.age.to_string())),
        ];
        match checks.into_iter().find(|(_, _, err)| err.is_some()) {
            Some((field, value, _)) => Err(LeadError::InvalidAnswer {
                field: field.to_string(),
                value,
            }),
            None => Ok(()),
        }
    }
}

/// Per-channel delivery state, the only part of a lead that changes after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFlags {
    pub webhook: ChannelStatus,
    pub notification: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for DeliveryFlags {
    fn default() -> Self {
        Self {
            webhook: ChannelStatus::Pending,
            notification: ChannelStatus::Pending,
            updated_at: None,
        }
    }
}

impl DeliveryFlags {
    /// Overall status implied by the channel outcomes.
    pub fn status(&self) -> LeadStatus {
        if self.webhook == ChannelStatus::Failed || self.notification == ChannelStatus::Failed {
            LeadStatus::DeliveryFailed
        } else {
            LeadStatus::Delivered
        }
    }
}

/// A captured lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_for: Option<CoverageFor>,
    #[serde(flatten)]
    pub profile: LeadProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
    #[serde(default)]
    pub phone_verified: bool,
    /// Raw funnel answers in the order they were given.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub answers: IndexMap<String, String>,
    pub status: LeadStatus,
    pub delivery: DeliveryFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn required<'a>(answers: &'a AnswerStore, key: &str) -> Result<&'a str, LeadError> {
    answers
        .get(key)
        .ok_or_else(|| LeadError::MissingAnswer(key.to_string()))
}

fn typed<T: FromStr>(answers: &AnswerStore, key: &str) -> Result<T, LeadError> {
    let raw = required(answers, key)?;
    raw.trim().parse().map_err(|_| LeadError::InvalidAnswer {
        field: key.to_string(),
        value: raw.to_string(),
    })
}

impl LeadRecord {
    /// Materialize a finished funnel into a lead.
    pub fn from_answers(
        answers: &AnswerStore,
        attribution: Attribution,
        quotes: Vec<CarrierQuote>,
    ) -> Result<Self, LeadError> {
        let term_length = if answers.contains("term") {
            typed(answers, "term")?
        } else {
            DEFAULT_TERM
        };
        let consent_given = answers.is("consent", "true");

        let profile = LeadProfile {
            age: typed(answers, "age")?,
            gender: typed(answers, "gender")?,
            smoker_status: typed(answers, "smoker")?,
            health_class: typed(answers, "health")?,
            coverage_amount: typed(answers, "coverage")?,
            term_length,
            rates_shown: quotes,
            first_name: required(answers, "name")?.trim().to_string(),
            email: required(answers, "email")?.trim().to_string(),
            phone: validate::digits(required(answers, "phone")?),
            zip: required(answers, "zip")?.trim().to_string(),
            consent_given,
            consent_text: answers.get("consent_text").unwrap_or_default().to_string(),
            attribution,
        };

        let mut lead = Self::from_profile(profile);
        lead.coverage_for = answers.parse("for_whom");
        lead.timing = answers.get("timing").map(str::to_string);
        lead.phone_verified = answers.is("phone_verify", "verified");
        lead.answers = answers.to_map();
        Ok(lead)
    }

    /// Wrap an already-structured profile, as received by direct ingest.
    pub fn from_profile(profile: LeadProfile) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            coverage_for: None,
            consent_at: profile.consent_given.then_some(now),
            profile,
            timing: None,
            phone_verified: false,
            answers: IndexMap::new(),
            status: LeadStatus::New,
            delivery: DeliveryFlags::default(),
            created_at: now,
        }
    }

    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn happy_answers() -> AnswerStore {
        AnswerStore::from_pairs([
            ("welcome", "yes"),
            ("for_whom", "self"),
            ("gender", "male"),
            ("smoker", "never"),
            ("health", "preferred_plus"),
            ("coverage", "750000"),
            ("timing", "right_away"),
            ("name", "Dana"),
            ("email", "dana@example.com"),
            ("phone", "5559991234"),
            ("phone_verify", "verified"),
            ("zip", "30301"),
            ("age", "38"),
            ("term", "20"),
            ("consent", "true"),
            ("consent_text", "I agree to be contacted."),
        ])
    }

    #[test]
    fn projection_reproduces_every_answer() {
        let answers = happy_answers();
        let lead = LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap();

        let typed = [
            ("for_whom", lead.coverage_for.map(|c| c.to_string())),
            ("gender", Some(lead.profile.gender.to_string())),
            ("smoker", Some(lead.profile.smoker_status.to_string())),
            ("health", Some(lead.profile.health_class.to_string())),
            ("coverage", Some(lead.profile.coverage_amount.to_string())),
            ("timing", lead.timing.clone()),
            ("name", Some(lead.profile.first_name.clone())),
            ("email", Some(lead.profile.email.clone())),
            ("phone", Some(lead.profile.phone.clone())),
            ("zip", Some(lead.profile.zip.clone())),
            ("age", Some(lead.profile.age.to_string())),
            ("term", Some(lead.profile.term_length.to_string())),
            ("consent_text", Some(lead.profile.consent_text.clone())),
        ];
        for (key, value) in typed {
            assert_eq!(value.as_deref(), answers.get(key), "field {key}");
        }
        assert!(lead.profile.consent_given);
        assert!(lead.phone_verified);
        assert!(lead.consent_at.is_some());

        // The raw snapshot keeps every entry in order.
        let snapshot: Vec<(&str, &str)> =
            lead.answers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let original: Vec<(&str, &str)> = answers.iter().collect();
        assert_eq!(snapshot, original);
    }

    #[test]
    fn skipped_term_projects_to_ten_years() {
        let mut answers = AnswerStore::new();
        for (k, v) in happy_answers().iter().filter(|(k, _)| *k != "term") {
            answers.record(k, v);
        }
        let lead = LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap();
        assert_eq!(lead.profile.term_length, 10);
    }

    #[test]
    fn missing_answer_is_reported() {
        let answers = AnswerStore::from_pairs([("gender", "male")]);
        let err = LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, LeadError::MissingAnswer(ref k) if k == "age"));
    }

    #[test]
    fn unknown_enum_value_is_invalid() {
        let mut answers = happy_answers();
        answers.reopen("health");
        answers.record("health", "superb");
        let err = LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap_err();
        assert!(matches!(err, LeadError::InvalidAnswer { ref field, .. } if field == "health"));
    }

    #[test]
    fn profile_serializes_camel_case_with_flat_attribution() {
        let attribution = Attribution {
            utm_source: Some("google".to_string()),
            ip_address: Some("203.0.113.7".to_string()),
            ..Default::default()
        };
        let lead = LeadRecord::from_answers(&happy_answers(), attribution, Vec::new()).unwrap();
        let json = serde_json::to_value(&lead.profile).unwrap();
        assert_eq!(json["firstName"], "Dana");
        assert_eq!(json["smokerStatus"], "never");
        assert_eq!(json["healthClass"], "preferred_plus");
        assert_eq!(json["utmSource"], "google");
        assert_eq!(json["ipAddress"], "203.0.113.7");
        assert!(json.get("utmMedium").is_none());
    }

    #[test]
    fn profile_validation_flags_bad_email() {
        let mut lead = LeadRecord::from_answers(&happy_answers(), Attribution::default(), Vec::new())
            .unwrap();
        assert!(lead.profile.validate().is_ok());
        lead.profile.email = "notanemail".to_string();
        let err = lead.profile.validate().unwrap_err();
        assert!(matches!(err, LeadError::InvalidAnswer { ref field, .. } if field == "email"));
    }

    #[test]
    fn delivery_status_from_flags() {
        let mut flags = DeliveryFlags::default();
        flags.webhook = ChannelStatus::Delivered;
        flags.notification = ChannelStatus::Skipped;
        assert_eq!(flags.status(), LeadStatus::Delivered);
        flags.notification = ChannelStatus::Failed;
        assert_eq!(flags.status(), LeadStatus::DeliveryFailed);
    }
}
