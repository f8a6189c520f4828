//! New-lead notifications over SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::NotificationConfig;
use crate::error::DeliveryError;
use crate::lead::model::LeadRecord;

/// Something that tells a human a new lead arrived.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, lead: &LeadRecord) -> Result<(), DeliveryError>;
}

/// Whole-dollar amount with thousands separators, e.g. `$1,250,000`.
pub fn format_usd(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    format!("${out}")
}

/// Subject and plain-text body for a new-lead email.
pub fn render(lead: &LeadRecord) -> (String, String) {
    let p = &lead.profile;
    let subject = format!("New Lead: {}", p.first_name);
    let body = format!(
        "New life insurance lead\n\n\
         Name: {}\n\
         Age: {}\n\
         Gender: {}\n\
         Smoker: {}\n\
         Health: {}\n\
         Coverage: {}\n\
         Term: {} years\n\
         Phone: {}\n\
         Email: {}\n\
         ZIP: {}\n\n\
         Lead ID: {}\n",
        p.first_name,
        p.age,
        p.gender,
        p.smoker_status,
        p.health_class,
        format_usd(p.coverage_amount),
        p.term_length,
        crate::funnel::validate::format_phone(&p.phone),
        p.email,
        p.zip,
        lead.id,
    );
    (subject, body)
}

/// Sends the new-lead email through an SMTP relay.
pub struct EmailNotifier {
    config: NotificationConfig,
}

impl EmailNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    /// Blocking send; run on the blocking pool.
    fn send_email(config: &NotificationConfig, subject: &str, body: String) -> Result<(), DeliveryError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| DeliveryError::Notification(format!("SMTP relay error: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(
                config
                    .from_address
                    .parse()
                    .map_err(|e| DeliveryError::Notification(format!("Invalid from address: {e}")))?,
            )
            .to(config
                .to_address
                .parse()
                .map_err(|e| DeliveryError::Notification(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body)
            .map_err(|e| DeliveryError::Notification(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| DeliveryError::Notification(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, lead: &LeadRecord) -> Result<(), DeliveryError> {
        let (subject, body) = render(lead);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::send_email(&config, &subject, body))
            .await
            .map_err(|e| DeliveryError::Notification(format!("Send task failed: {e}")))??;

        tracing::info!(lead_id = %lead.id, to = %self.config.to_address, "Lead notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::AnswerStore;
    use crate::lead::model::Attribution;

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(0), "$0");
        assert_eq!(format_usd(999), "$999");
        assert_eq!(format_usd(250_000), "$250,000");
        assert_eq!(format_usd(1_500_000), "$1,500,000");
    }

    #[test]
    fn render_lists_lead_fields() {
        let answers = AnswerStore::from_pairs([
            ("gender", "male"),
            ("smoker", "current"),
            ("health", "standard_plus"),
            ("coverage", "750000"),
            ("name", "Sam"),
            ("email", "sam@example.com"),
            ("phone", "5559991234"),
            ("zip", "94105"),
            ("age", "47"),
            ("term", "15"),
            ("consent", "true"),
        ]);
        let lead = LeadRecord::from_answers(&answers, Attribution::default(), Vec::new()).unwrap();
        let (subject, body) = render(&lead);

        assert_eq!(subject, "New Lead: Sam");
        assert!(body.contains("Coverage: $750,000"));
        assert!(body.contains("Smoker: current"));
        assert!(body.contains("Term: 15 years"));
        assert!(body.contains("Phone: (555) 999-1234"));
        assert!(body.contains(&lead.id.to_string()));
    }
}
