//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Read an env var and parse it, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Reveal pacing for a funnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelTiming {
    /// "Typing" pause before each bot message.
    pub thinking: Duration,
    /// Pause after an auto step before moving on.
    pub auto_advance: Duration,
    /// Pause after the quote results before moving on.
    pub result_display: Duration,
    /// Pause between accepting an answer and revealing the next step.
    pub post_answer: Duration,
    /// Upper bound on a quote lookup.
    pub quote_timeout: Duration,
    /// Upper bound on each verification send or check.
    pub verify_timeout: Duration,
}

impl Default for FunnelTiming {
    fn default() -> Self {
        Self {
            thinking: Duration::from_millis(800),
            auto_advance: Duration::from_millis(1200),
            result_display: Duration::from_millis(1500),
            post_answer: Duration::from_millis(300),
            quote_timeout: Duration::from_secs(10),
            verify_timeout: Duration::from_secs(10),
        }
    }
}

impl FunnelTiming {
    /// No pacing at all. Used by tests and `FUNNEL_INSTANT=1`.
    pub fn instant() -> Self {
        Self {
            thinking: Duration::ZERO,
            auto_advance: Duration::ZERO,
            result_display: Duration::ZERO,
            post_answer: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        match env_opt("FUNNEL_INSTANT").as_deref() {
            Some("1") | Some("true") => Self::instant(),
            _ => Self::default(),
        }
    }
}

/// Delivery worker settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Webhook endpoint. The webhook step is skipped when unset.
    pub webhook_url: Option<String>,
    /// Attempts per delivery step before it is marked permanently failed.
    pub max_attempts: u32,
    /// How often the worker polls the queue. Never zero.
    pub poll_interval: Duration,
    /// Upper bound on a single delivery step.
    pub step_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            max_attempts: 3,
            poll_interval: Duration::from_secs(5),
            step_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_attempts = env_or("DELIVERY_MAX_ATTEMPTS", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELIVERY_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let poll_secs = env_or("DELIVERY_POLL_SECS", defaults.poll_interval.as_secs())?;
        if poll_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELIVERY_POLL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let step_secs = env_or("DELIVERY_STEP_TIMEOUT_SECS", defaults.step_timeout.as_secs())?;
        if step_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELIVERY_STEP_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            webhook_url: env_opt("WEBHOOK_URL"),
            max_attempts,
            poll_interval: Duration::from_secs(poll_secs),
            step_timeout: Duration::from_secs(step_secs),
            ..defaults
        })
    }

    /// Delay before attempt `attempt + 1` of a task that just failed its
    /// `attempt`-th run.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// SMTP settings for the new-lead email.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
}

impl NotificationConfig {
    /// `None` when `SMTP_HOST` is unset: notifications are then skipped.
    pub fn from_env() -> Option<Self> {
        let smtp_host = env_opt("SMTP_HOST")?;

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = env_opt("NOTIFY_FROM").unwrap_or_else(|| username.clone());
        let to_address = env_opt("NOTIFY_TO").unwrap_or_else(|| from_address.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            to_address,
        })
    }
}

/// Top-level service settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub quotes_api_url: String,
    pub verify_api_url: String,
    /// Number the call-to-action dials.
    pub agent_phone: String,
    pub timing: FunnelTiming,
    /// Sessions with no client activity for this long are abandoned.
    pub session_ttl: Duration,
    pub delivery: DeliveryConfig,
    pub notification: Option<NotificationConfig>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let quotes_api_url = env_opt("QUOTES_API_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("QUOTES_API_URL".to_string()))?;
        let verify_api_url = env_opt("VERIFY_API_URL").unwrap_or_else(|| quotes_api_url.clone());
        let session_ttl_secs: u64 = env_or("SESSION_TTL_SECS", 30 * 60)?;
        if session_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SESSION_TTL_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            db_path: PathBuf::from(
                env_opt("FUNNEL_DB_PATH").unwrap_or_else(|| "./data/lead-funnel.db".to_string()),
            ),
            port: env_or("FUNNEL_PORT", 8080)?,
            quotes_api_url,
            verify_api_url,
            agent_phone: env_opt("AGENT_PHONE").unwrap_or_else(|| "8005550100".to_string()),
            timing: FunnelTiming::from_env(),
            session_ttl: Duration::from_secs(session_ttl_secs),
            delivery: DeliveryConfig::from_env()?,
            notification: NotificationConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_matches_reveal_pacing() {
        let t = FunnelTiming::default();
        assert_eq!(t.thinking, Duration::from_millis(800));
        assert_eq!(t.auto_advance, Duration::from_millis(1200));
        assert_eq!(t.result_display, Duration::from_millis(1500));
        assert_eq!(t.post_answer, Duration::from_millis(300));
    }

    #[test]
    fn instant_timing_keeps_quote_timeout() {
        let t = FunnelTiming::instant();
        assert!(t.thinking.is_zero());
        assert_eq!(t.quote_timeout, Duration::from_secs(10));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = DeliveryConfig::default();
        assert_eq!(cfg.backoff(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff(2), Duration::from_secs(4));
        assert_eq!(cfg.backoff(3), Duration::from_secs(8));
        assert_eq!(cfg.backoff(40), cfg.backoff_cap);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        // SAFETY: This test runs in isolation; no other thread reads DELIVERY_POLL_SECS concurrently.
        unsafe { std::env::set_var("DELIVERY_POLL_SECS", "0") };
        let err = DeliveryConfig::from_env().unwrap_err();
        unsafe { std::env::remove_var("DELIVERY_POLL_SECS") };
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DELIVERY_POLL_SECS")
        );
    }

    #[test]
    fn notification_config_none_without_host() {
        // SAFETY: This test runs in isolation; no other thread reads SMTP_HOST concurrently.
        unsafe { std::env::remove_var("SMTP_HOST") };
        assert!(NotificationConfig::from_env().is_none());
    }
}
