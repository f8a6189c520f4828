//! Quote lookup against an opaque pricing service.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::QuoteError;
use crate::funnel::AnswerStore;
use crate::funnel::catalog::DEFAULT_TERM;
use crate::lead::model::{Gender, HealthClass, SmokerStatus};

/// Risk profile sent to the pricing service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub age: u32,
    pub gender: Gender,
    pub smoker_status: SmokerStatus,
    pub health_class: HealthClass,
    pub coverage_amount: u64,
    pub term_length: u32,
}

impl QuoteRequest {
    /// Build a request from funnel answers. A skipped term question means the
    /// default ten-year term.
    pub fn from_answers(answers: &AnswerStore) -> Result<Self, QuoteError> {
        fn field<T: std::str::FromStr>(answers: &AnswerStore, key: &str) -> Result<T, QuoteError> {
            answers
                .parse(key)
                .ok_or_else(|| QuoteError::IncompleteProfile(key.to_string()))
        }

        Ok(Self {
            age: field(answers, "age")?,
            gender: field(answers, "gender")?,
            smoker_status: field(answers, "smoker")?,
            health_class: field(answers, "health")?,
            coverage_amount: field(answers, "coverage")?,
            term_length: answers.parse("term").unwrap_or(DEFAULT_TERM),
        })
    }
}

/// One carrier's priced offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarrierQuote {
    pub carrier_id: String,
    pub carrier_name: String,
    pub monthly_rate: Decimal,
    pub annual_rate: Decimal,
    #[serde(alias = "amBestRating")]
    pub rating: String,
}

/// Anything that can price a risk profile.
#[async_trait]
pub trait QuoteLookup: Send + Sync {
    /// Ordered offers, possibly empty.
    async fn lookup(&self, request: &QuoteRequest) -> Result<Vec<CarrierQuote>, QuoteError>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    quotes: Vec<CarrierQuote>,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Pricing service reached over HTTP at `GET {base}/api/rates`.
pub struct HttpQuoteLookup {
    base_url: String,
    client: reqwest::Client,
}

impl HttpQuoteLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl QuoteLookup for HttpQuoteLookup {
    async fn lookup(&self, request: &QuoteRequest) -> Result<Vec<CarrierQuote>, QuoteError> {
        let resp = self
            .client
            .get(format!("{}/api/rates", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .query(&[
                ("age", request.age.to_string()),
                ("gender", request.gender.to_string()),
                ("smoker", request.smoker_status.to_string()),
                ("health", request.health_class.to_string()),
                ("coverage", request.coverage_amount.to_string()),
                ("term", request.term_length.to_string()),
            ])
            .send()
            .await
            .map_err(|e| QuoteError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(QuoteError::Status(resp.status().as_u16()));
        }

        let body: RatesResponse = resp
            .json()
            .await
            .map_err(|e| QuoteError::InvalidResponse(e.to_string()))?;
        tracing::debug!(count = body.quotes.len(), "Quote lookup returned");
        Ok(body.quotes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn full_answers() -> AnswerStore {
        AnswerStore::from_pairs([
            ("gender", "female"),
            ("smoker", "former"),
            ("health", "preferred"),
            ("coverage", "500000"),
            ("age", "41"),
            ("term", "20"),
        ])
    }

    #[test]
    fn request_from_answers() {
        let req = QuoteRequest::from_answers(&full_answers()).unwrap();
        assert_eq!(req.age, 41);
        assert_eq!(req.gender, Gender::Female);
        assert_eq!(req.smoker_status, SmokerStatus::Former);
        assert_eq!(req.health_class, HealthClass::Preferred);
        assert_eq!(req.coverage_amount, 500_000);
        assert_eq!(req.term_length, 20);
    }

    #[test]
    fn skipped_term_defaults_to_ten_years() {
        let answers = AnswerStore::from_pairs([
            ("gender", "male"),
            ("smoker", "never"),
            ("health", "standard"),
            ("coverage", "250000"),
            ("age", "80"),
        ]);
        assert_eq!(QuoteRequest::from_answers(&answers).unwrap().term_length, 10);
    }

    #[test]
    fn missing_field_is_incomplete_profile() {
        let answers = AnswerStore::from_pairs([("gender", "male")]);
        let err = QuoteRequest::from_answers(&answers).unwrap_err();
        assert!(matches!(err, QuoteError::IncompleteProfile(ref f) if f == "age"));
    }

    #[test]
    fn quote_accepts_legacy_rating_field() {
        let json = r#"{"carrierId":"banner","carrierName":"Banner Life",
            "monthlyRate":"21.50","annualRate":"245.10","amBestRating":"A+"}"#;
        let quote: CarrierQuote = serde_json::from_str(json).unwrap();
        assert_eq!(quote.rating, "A+");
        assert_eq!(quote.monthly_rate, dec!(21.50));
    }
}
