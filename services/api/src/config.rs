use nova_sonic::NovaSonicConfig;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with access to a calculator tool.";
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_TRANSCRIPT_IDLE_MS: u64 = 1000;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// Backend credentials are optional. A missing key only makes that backend
/// unavailable; it never stops the server from starting.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub system_prompt: String,
    pub outbound_queue_capacity: usize,
    pub transcript_idle: Duration,

    pub openai_api_key: Option<SecretString>,
    pub openai_model: String,
    pub openai_voice: String,

    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub gemini_voice: String,

    /// Either an access key pair or a named profile is present.
    pub aws_credentials_present: bool,
    pub nova_sonic: NovaSonicConfig,
}

/// Reads a variable, treating an empty value as unset.
fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:8000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let outbound_queue_capacity =
            parse_var("OUTBOUND_QUEUE_CAPACITY", DEFAULT_OUTBOUND_QUEUE_CAPACITY)?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "OUTBOUND_QUEUE_CAPACITY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let transcript_idle =
            Duration::from_millis(parse_var("TRANSCRIPT_IDLE_MS", DEFAULT_TRANSCRIPT_IDLE_MS)?);

        let aws_credentials_present = (var("AWS_ACCESS_KEY_ID").is_some()
            && var("AWS_SECRET_ACCESS_KEY").is_some())
            || var("AWS_PROFILE").is_some();

        Ok(Self {
            bind_address,
            log_level,
            system_prompt: var_or("SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            outbound_queue_capacity,
            transcript_idle,

            openai_api_key: var("OPENAI_API_KEY").map(SecretString::from),
            openai_model: var_or("OPENAI_REALTIME_MODEL", openai_realtime::DEFAULT_MODEL),
            openai_voice: var_or("OPENAI_VOICE", openai_realtime::DEFAULT_VOICE),

            gemini_api_key: var("GOOGLE_API_KEY")
                .or_else(|| var("GEMINI_API_KEY"))
                .map(SecretString::from),
            gemini_model: var_or("GEMINI_LIVE_MODEL", gemini_realtime::DEFAULT_MODEL),
            gemini_voice: var_or("GEMINI_VOICE", gemini_realtime::DEFAULT_VOICE),

            aws_credentials_present,
            nova_sonic: NovaSonicConfig {
                region: var_or("AWS_REGION", nova_sonic::DEFAULT_REGION),
                model_id: var_or("NOVA_SONIC_MODEL_ID", nova_sonic::DEFAULT_MODEL_ID),
                voice: var_or("NOVA_SONIC_VOICE", nova_sonic::DEFAULT_VOICE),
                endpointing_sensitivity: var_or(
                    "NOVA_SONIC_ENDPOINTING",
                    nova_sonic::DEFAULT_ENDPOINTING_SENSITIVITY,
                ),
            },
        })
    }
}
