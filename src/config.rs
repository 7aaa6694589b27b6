use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read or parse the `.env` file.
    EnvFile { path: PathBuf, source: dotenvy::Error },
    /// Required variables that are unset or empty.
    Missing(Vec<&'static str>),
    /// A variable is set but cannot be parsed.
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnvFile { path, source } => {
                write!(f, "failed to load env file '{}': {}", path.display(), source)
            }
            Self::Missing(keys) => {
                write!(f, "missing environment variables: {}", keys.join(", "))
            }
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::EnvFile { source, .. } => Some(source),
            Self::Missing(_) | Self::InvalidValue { .. } => None,
        }
    }
}

/// Sampling parameters sent with every inference request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParameters {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub return_full_text: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_new_tokens: 500,
            temperature: 0.7,
            top_p: 0.95,
            repetition_penalty: 1.1,
            return_full_text: false,
        }
    }
}

pub const DEFAULT_WHATSAPP_NUMBER: &str = "whatsapp:+12525818652";
pub const DEFAULT_TWILIO_API_BASE: &str = "https://api.twilio.com";
pub const DEFAULT_MODEL: &str = "HuggingFaceH4/zephyr-7b-beta";
pub const DEFAULT_HUGGINGFACE_API_BASE: &str = "https://api-inference.huggingface.co/models";

pub struct Config {
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    /// Sender address, `whatsapp:`-prefixed.
    pub twilio_whatsapp_number: String,
    pub twilio_api_base: String,
    /// Public URL Twilio posts the webhook to. Enables signature checks when set.
    pub twilio_webhook_url: Option<String>,
    pub huggingface_api_key: String,
    pub huggingface_model: String,
    pub huggingface_api_base: String,
    pub generation: GenerationParameters,
    pub log_level: String,
    pub log_file: PathBuf,
    pub host: String,
    pub port: u16,
    pub debug: bool,
}

impl Config {
    /// Load from the process environment, falling back to `env_file` for
    /// variables the environment does not set.
    pub fn load(env_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file_vars = match env_file {
            Some(path) => read_env_file(path)?,
            None => HashMap::new(),
        };
        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }

    /// Build a config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = ["TWILIO_ACCOUNT_SID", "TWILIO_AUTH_TOKEN", "HUGGINGFACE_API_KEY"];
        let missing: Vec<&'static str> = required.into_iter().filter(|k| get(*k).is_none()).collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let defaults = GenerationParameters::default();
        let generation = GenerationParameters {
            max_new_tokens: parse_or(&get, "HF_MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            temperature: parse_or(&get, "HF_TEMPERATURE", defaults.temperature)?,
            top_p: parse_or(&get, "HF_TOP_P", defaults.top_p)?,
            repetition_penalty: parse_or(&get, "HF_REPETITION_PENALTY", defaults.repetition_penalty)?,
            return_full_text: false,
        };

        let debug = match get("DEBUG") {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => false,
        };

        Ok(Self {
            twilio_account_sid: get("TWILIO_ACCOUNT_SID").unwrap_or_default(),
            twilio_auth_token: get("TWILIO_AUTH_TOKEN").unwrap_or_default(),
            twilio_whatsapp_number: get("TWILIO_WHATSAPP_NUMBER")
                .unwrap_or_else(|| DEFAULT_WHATSAPP_NUMBER.to_string()),
            twilio_api_base: get("TWILIO_API_BASE")
                .unwrap_or_else(|| DEFAULT_TWILIO_API_BASE.to_string()),
            twilio_webhook_url: get("TWILIO_WEBHOOK_URL"),
            huggingface_api_key: get("HUGGINGFACE_API_KEY").unwrap_or_default(),
            huggingface_model: get("HUGGINGFACE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            huggingface_api_base: get("HUGGINGFACE_API_BASE")
                .unwrap_or_else(|| DEFAULT_HUGGINGFACE_API_BASE.to_string()),
            generation,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: get("LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs/whatsapp_bot.log")),
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&get, "PORT", 5000)?,
            debug,
        })
    }

    /// Full inference URL for the configured model.
    pub fn huggingface_api_url(&self) -> String {
        format!(
            "{}/{}",
            self.huggingface_api_base.trim_end_matches('/'),
            self.huggingface_model
        )
    }

    /// Default log filter directive. Debug mode lowers it to `debug`.
    pub fn log_directive(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.log_level.to_lowercase()
        }
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let to_err = |source| ConfigError::EnvFile { path: path.to_path_buf(), source };
    let mut vars = HashMap::new();
    for item in dotenvy::from_path_iter(path).map_err(to_err)? {
        let (key, value) = item.map_err(to_err)?;
        vars.insert(key, value);
    }
    Ok(vars)
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}
