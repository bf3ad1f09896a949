//! Session Bootstrap
//!
//! Resolves the backend a client asked for, checks that its credentials are
//! present and builds the model for one agent run. Every failure here happens
//! before any agent run starts and ends the connection with a close code.

use crate::config::Config;
use bidi_core::{RelayError, model::RealtimeModel};
use gemini_realtime::{GeminiLiveConfig, GeminiLiveModel};
use nova_sonic::NovaSonicModel;
use openai_realtime::{OpenAIRealtimeConfig, OpenAIRealtimeModel};
use serde::Serialize;
use std::{fmt, str::FromStr, sync::Arc};
use utoipa::ToSchema;

/// The realtime backends a client can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    NovaSonic,
    Gemini,
    OpenAI,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::NovaSonic, Backend::Gemini, Backend::OpenAI];

    /// The identifier used in `/ws/{model_name}`.
    pub fn id(&self) -> &'static str {
        match self {
            Backend::NovaSonic => "novasonic",
            Backend::Gemini => "gemini",
            Backend::OpenAI => "openai",
        }
    }

    /// What must be set in the environment for this backend.
    pub fn credential_hint(&self) -> &'static str {
        match self {
            Backend::NovaSonic => {
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, or AWS_PROFILE"
            }
            Backend::Gemini => "GOOGLE_API_KEY",
            Backend::OpenAI => "OPENAI_API_KEY",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Backend {
    type Err = RelayError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|backend| backend.id() == name)
            .ok_or_else(|| RelayError::Configuration(format!("Invalid model: {name}")))
    }
}

/// Which backends can currently serve a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct ModelAvailability {
    pub novasonic: bool,
    pub gemini: bool,
    pub openai: bool,
}

impl ModelAvailability {
    pub fn is_available(&self, backend: Backend) -> bool {
        match backend {
            Backend::NovaSonic => self.novasonic,
            Backend::Gemini => self.gemini,
            Backend::OpenAI => self.openai,
        }
    }
}

/// Checks which backends have credentials configured.
pub fn check_available_models(config: &Config) -> ModelAvailability {
    ModelAvailability {
        novasonic: config.aws_credentials_present && nova_sonic::transport_available(),
        gemini: config.gemini_api_key.is_some(),
        openai: config.openai_api_key.is_some(),
    }
}

/// Builds models for agent runs.
#[cfg_attr(test, mockall::automock)]
pub trait ModelFactory: Send + Sync {
    fn availability(&self) -> ModelAvailability;

    /// Builds a fresh model for one agent run.
    fn create(&self, backend: Backend) -> Result<Box<dyn RealtimeModel>, RelayError>;
}

/// The production factory, driven by [`Config`].
pub struct BackendFactory {
    config: Arc<Config>,
}

impl BackendFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ModelFactory for BackendFactory {
    fn availability(&self) -> ModelAvailability {
        check_available_models(&self.config)
    }

    fn create(&self, backend: Backend) -> Result<Box<dyn RealtimeModel>, RelayError> {
        let unavailable = || {
            RelayError::BackendUnavailable(format!(
                "{backend} requires {}",
                backend.credential_hint()
            ))
        };
        match backend {
            Backend::OpenAI => {
                let api_key = self.config.openai_api_key.clone().ok_or_else(unavailable)?;
                Ok(Box::new(OpenAIRealtimeModel::new(OpenAIRealtimeConfig {
                    api_key,
                    model: self.config.openai_model.clone(),
                    voice: self.config.openai_voice.clone(),
                })))
            }
            Backend::Gemini => {
                let api_key = self.config.gemini_api_key.clone().ok_or_else(unavailable)?;
                Ok(Box::new(GeminiLiveModel::new(GeminiLiveConfig {
                    api_key,
                    model: self.config.gemini_model.clone(),
                    voice: self.config.gemini_voice.clone(),
                })))
            }
            Backend::NovaSonic => {
                if !nova_sonic::transport_available() {
                    return Err(RelayError::BackendUnavailable(
                        "novasonic support is not compiled into this server (enable the `nova-sonic` feature)"
                            .to_string(),
                    ));
                }
                if !self.config.aws_credentials_present {
                    return Err(unavailable());
                }
                Ok(Box::new(NovaSonicModel::new(self.config.nova_sonic.clone())))
            }
        }
    }
}

/// Resolves a client's backend selection into a model ready to run.
///
/// `declared_input_rate` is the capture rate the client announced, if any.
pub fn bootstrap(
    factory: &dyn ModelFactory,
    model_name: &str,
    declared_input_rate: Option<u32>,
) -> Result<Box<dyn RealtimeModel>, RelayError> {
    let backend = model_name.parse::<Backend>()?;
    let model = factory.create(backend)?;
    model.audio_config().check_input_rate(declared_input_rate)?;
    Ok(model)
}

/// WebSocket close reasons are limited to 123 bytes.
pub fn close_reason(err: &RelayError) -> String {
    const MAX_CLOSE_REASON: usize = 123;
    let mut reason = match err {
        // The client-facing text for an unknown backend is the bare message.
        RelayError::Configuration(message) => message.clone(),
        other => other.to_string(),
    };
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
