//! Environment-backed configuration for `chat-smoke`.

use std::{env, error::Error, fmt};

use chat_core::{Identity, SendMode, SessionConfig};
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:5002/api/v1";
const DEFAULT_RUN_FOR_MS: u64 = 15_000;

/// Settings for one smoke run against a live chat service.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// REST base url, e.g. `http://localhost:5002/api/v1`.
    pub api_url: Url,
    /// Socket.IO server url. Defaults to the REST base url.
    pub socket_url: Url,
    pub auth_token: String,
    pub identity: Identity,
    /// Conversation to open after sign-in.
    pub conversation_id: Option<String>,
    /// Text sent once the conversation is active.
    pub message: Option<String>,
    pub session: SessionConfig,
    pub run_for_ms: u64,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let api_url = parse_url(
            "CHAT_API_URL",
            optional_trimmed_env("CHAT_API_URL", &mut lookup)
                .unwrap_or_else(|| DEFAULT_API_URL.to_owned()),
        )?;
        let socket_url = match optional_trimmed_env("CHAT_SOCKET_URL", &mut lookup) {
            Some(value) => parse_url("CHAT_SOCKET_URL", value)?,
            None => api_url.clone(),
        };

        let auth_token = required_env("CHAT_AUTH_TOKEN", &mut lookup)?;
        let user_id = required_env("CHAT_USER_ID", &mut lookup)?;
        let user_name =
            optional_trimmed_env("CHAT_USER_NAME", &mut lookup).unwrap_or_else(|| user_id.clone());

        let conversation_id = optional_trimmed_env("CHAT_CONVERSATION_ID", &mut lookup);
        let message = optional_trimmed_env("CHAT_SMOKE_MESSAGE", &mut lookup);

        let defaults = SessionConfig::default();
        let typing_idle_ms =
            parse_optional_u64("CHAT_TYPING_IDLE_MS", &mut lookup)?.unwrap_or(defaults.typing_idle_ms);
        let remote_typing_expiry_ms =
            match parse_optional_u64("CHAT_REMOTE_TYPING_EXPIRY_MS", &mut lookup)? {
                Some(0) => None,
                Some(value) => Some(value),
                None => defaults.remote_typing_expiry_ms,
            };
        let send_mode = if parse_optional_bool("CHAT_OPTIMISTIC_SEND", &mut lookup)?.unwrap_or(false)
        {
            SendMode::Optimistic
        } else {
            SendMode::AwaitAck
        };
        let max_messages = parse_optional_u64("CHAT_MAX_MESSAGES", &mut lookup)?
            .map(|value| value as usize)
            .unwrap_or(defaults.max_messages);
        let run_for_ms =
            parse_optional_u64("CHAT_SMOKE_DURATION_MS", &mut lookup)?.unwrap_or(DEFAULT_RUN_FOR_MS);

        if typing_idle_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_TYPING_IDLE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if max_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_MAX_MESSAGES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            api_url,
            socket_url,
            auth_token,
            identity: Identity::new(user_id, user_name),
            conversation_id,
            message,
            session: SessionConfig {
                typing_idle_ms,
                remote_typing_expiry_ms,
                send_mode,
                max_messages,
                ..defaults
            },
            run_for_ms,
        })
    }
}

/// Errors produced while parsing smoke configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} must be set"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    match Url::parse(&value) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "ws" | "wss") => Ok(url),
        Ok(url) => Err(ConfigError::InvalidValue {
            key,
            reason: format!("unsupported scheme '{}'", url.scheme()),
            value,
        }),
        Err(err) => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        }),
    }
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}
