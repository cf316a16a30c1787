//! Configuration types, loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::followup::DeliveryPolicy;

/// Discord connection settings.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    pub guild_id: String,
    /// Role granted once onboarding completes.
    pub member_role_id: String,
    /// Public channel for "new member" announcements (optional).
    pub announce_channel_id: Option<String>,
}

/// Follow-up scheduler settings.
#[derive(Debug, Clone)]
pub struct FollowupConfig {
    /// How often the ticker runs every follow-up job.
    pub interval: Duration,
    /// Maximum members processed concurrently within one run.
    pub fanout: usize,
    /// Timeout applied to each chat call inside a run.
    pub call_timeout: Duration,
    pub policy: DeliveryPolicy,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600), // 10 minutes
            fanout: 10,
            call_timeout: Duration::from_secs(10),
            policy: DeliveryPolicy::default(),
        }
    }
}

/// Full bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub discord: DiscordConfig,
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Base URL members are sent to for email verification.
    pub public_url: String,
    pub followup: FollowupConfig,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl BotConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = required("DISCORD_BOT_TOKEN")?;
        let guild_id = required("DISCORD_GUILD_ID")?;
        let member_role_id = required("DISCORD_MEMBER_ROLE_ID")?;
        let announce_channel_id = std::env::var("DISCORD_ANNOUNCE_CHANNEL_ID")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let db_path = std::env::var("ONBOARD_DB_PATH")
            .unwrap_or_else(|_| "./data/onboard.db".to_string())
            .into();
        let http_port: u16 = parsed("ONBOARD_HTTP_PORT", 8080)?;
        let public_url = std::env::var("ONBOARD_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://localhost:{http_port}"))
            .trim_end_matches('/')
            .to_string();

        let defaults = FollowupConfig::default();
        let followup = FollowupConfig {
            interval: Duration::from_secs(parsed(
                "FOLLOWUP_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            fanout: parsed("FOLLOWUP_FANOUT", defaults.fanout)?.max(1),
            call_timeout: Duration::from_secs(parsed(
                "FOLLOWUP_RESOLVE_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )?),
            policy: parsed("FOLLOWUP_DELIVERY_POLICY", defaults.policy)?,
        };

        let log_dir = std::env::var("ONBOARD_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            discord: DiscordConfig {
                bot_token: SecretString::from(bot_token),
                guild_id,
                member_role_id,
                announce_channel_id,
            },
            db_path,
            http_port,
            public_url,
            followup,
            log_dir,
        })
    }
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
