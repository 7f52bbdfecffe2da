use rust_decimal::Decimal;
use rust_decimal::Error as DecimalParseError;
use std::env;
use std::fmt;
use std::num::{ParseFloatError, ParseIntError};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    DecimalParseError(DecimalParseError),
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {}: '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

/// Non-empty, trimmed value of an environment variable.
pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_f64(key: &str) -> Result<Option<f64>, ConfigError> {
    env_string(key)
        .map(|v| v.parse::<f64>())
        .transpose()
        .map_err(ConfigError::from)
}

pub fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    env_string(key)
        .map(|v| v.parse::<u64>())
        .transpose()
        .map_err(ConfigError::from)
}

pub fn env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    env_string(key)
        .map(|v| v.parse::<u32>())
        .transpose()
        .map_err(ConfigError::from)
}

pub fn env_decimal(key: &str) -> Result<Option<Decimal>, ConfigError> {
    env_string(key)
        .map(|v| Decimal::from_str(&v))
        .transpose()
        .map_err(ConfigError::from)
}

pub fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env_string(key) {
        None => Ok(None),
        Some(v) => parse_bool(&v).map(Some).ok_or(ConfigError::InvalidValue {
            key: key.to_string(),
            value: v,
        }),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Reads SMTP alert settings. Returns `Ok(None)` when `SMTP_HOST` or
/// `ALERT_EMAIL_TO` is unset, which disables email alerts.
pub fn get_smtp_config_from_env() -> Result<Option<SmtpConfig>, ConfigError> {
    let (Some(host), Some(to)) = (env_string("SMTP_HOST"), env_string("ALERT_EMAIL_TO")) else {
        return Ok(None);
    };
    let port = match env_string("SMTP_PORT") {
        Some(v) => v.parse::<u16>()?,
        None => 587,
    };
    let username = env_string("SMTP_USERNAME");
    let from = env_string("ALERT_EMAIL_FROM")
        .or_else(|| username.clone())
        .ok_or(ConfigError::InvalidValue {
            key: "ALERT_EMAIL_FROM".to_string(),
            value: String::new(),
        })?;
    let to: Vec<String> = to
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    Ok(Some(SmtpConfig {
        host,
        port,
        username,
        password: env_string("SMTP_PASSWORD"),
        from,
        to,
    }))
}
