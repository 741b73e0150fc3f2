//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;

use crate::chat::sms::SmsConfig;
use crate::chat::whatsapp::WhatsAppConfig;
use crate::payments::mpesa::{MpesaConfig, PRODUCTION_BASE_URL, SANDBOX_BASE_URL};

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub mpesa: MpesaConfig,
    pub whatsapp: WhatsAppSettings,
    pub sms: SmsSettings,
    pub retry: RetryConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone)]
pub enum LogFormat {
    Json,
    Plain,
}

/// WhatsApp transport settings, including webhook verification.
#[derive(Debug, Clone)]
pub struct WhatsAppSettings {
    pub transport: WhatsAppConfig,
    pub verify_token: String,
}

#[derive(Debug, Clone)]
pub struct SmsSettings {
    pub transport: SmsConfig,
    pub enabled: bool,
}

/// Retry policy settings
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: i32,
    pub cooldown_secs: u64,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            mpesa: mpesa_from_env()?,
            whatsapp: WhatsAppSettings::from_env()?,
            sms: SmsSettings::from_env()?,
            retry: RetryConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.database.validate()?;
        self.logging.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env_or("SERVER_HOST", "127.0.0.1"),
            port: env_parse("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env_or("DATABASE_URL", ""),
            max_connections: env_parse("DB_MAX_CONNECTIONS", 20)?,
            min_connections: env_parse("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: env_parse("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }
        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env_or("LOG_LEVEL", "INFO"),
            format: match env_or("LOG_FORMAT", "plain").as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }
        Ok(())
    }
}

fn mpesa_from_env() -> Result<MpesaConfig, ConfigError> {
    let environment = env_or("MPESA_ENVIRONMENT", "sandbox").to_lowercase();
    let base_url = env::var("MPESA_BASE_URL").unwrap_or_else(|_| {
        if environment == "production" {
            PRODUCTION_BASE_URL.to_string()
        } else {
            SANDBOX_BASE_URL.to_string()
        }
    });

    Ok(MpesaConfig {
        consumer_key: env_or("MPESA_CONSUMER_KEY", ""),
        consumer_secret: env_or("MPESA_CONSUMER_SECRET", ""),
        shortcode: env_or("MPESA_SHORTCODE", ""),
        passkey: env_or("MPESA_PASSKEY", ""),
        callback_url: env_or("MPESA_CALLBACK_URL", ""),
        base_url,
        timeout_secs: env_parse("MPESA_TIMEOUT_SECS", 30)?,
        max_retries: env_parse("MPESA_MAX_RETRIES", 2)?,
    })
}

impl WhatsAppSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(WhatsAppSettings {
            transport: WhatsAppConfig {
                api_url: env_or("WABA_API_URL", "https://waba.360dialog.io/v1"),
                api_key: env_or("WABA_API_KEY", ""),
                timeout_secs: env_parse("WABA_TIMEOUT_SECS", 10)?,
            },
            verify_token: env_or("WABA_VERIFY_TOKEN", ""),
        })
    }
}

impl SmsSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_or("SMS_API_KEY", "");
        Ok(SmsSettings {
            enabled: !api_key.is_empty(),
            transport: SmsConfig {
                api_url: env_or(
                    "SMS_API_URL",
                    "https://api.africastalking.com/version1/messaging",
                ),
                api_key,
                username: env_or("SMS_USERNAME", ""),
                timeout_secs: env_parse("SMS_TIMEOUT_SECS", 10)?,
            },
        })
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(RetryConfig {
            max_attempts: env_parse(
                "PAYMENT_MAX_RETRIES",
                crate::services::retry_policy::DEFAULT_MAX_RETRIES,
            )?,
            cooldown_secs: env_parse(
                "PAYMENT_RETRY_COOLDOWN_SECS",
                crate::services::retry_policy::DEFAULT_RETRY_COOLDOWN_SECS,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_MAX_RETRIES cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),
}
