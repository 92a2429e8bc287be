use std::{fmt, time::Duration};

use anyhow::Context;

use crate::{airvisual, iot_hub::ConnectionString};

pub const API_KEY_VAR: &str = "IQAIR_API_KEY";
pub const CONNECTION_STRING_VAR: &str = "IOT_HUB_DEVICE_CONNECTION_STRING";
pub const BASE_URL_VAR: &str = "IQAIR_BASE_URL";
pub const INTERVAL_VAR: &str = "RELAY_INTERVAL_SECS";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct Config {
    pub api_key: String,
    pub connection_string: ConnectionString,
    pub api_base_url: String,
    pub interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config, anyhow::Error> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, anyhow::Error> {
        let read = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = read(API_KEY_VAR).with_context(|| format!("{API_KEY_VAR} is not set"))?;
        let connection_string = read(CONNECTION_STRING_VAR)
            .with_context(|| format!("{CONNECTION_STRING_VAR} is not set"))?
            .parse::<ConnectionString>()
            .with_context(|| format!("{CONNECTION_STRING_VAR} is invalid"))?;

        let api_base_url =
            read(BASE_URL_VAR).unwrap_or_else(|| airvisual::DEFAULT_BASE_URL.to_string());

        let interval = match read(INTERVAL_VAR) {
            Some(v) => {
                let secs: u64 = v
                    .parse()
                    .with_context(|| format!("{INTERVAL_VAR} must be a number of seconds, got {v}"))?;
                let interval = Duration::from_secs(secs);
                if interval.is_zero() || interval > MAX_INTERVAL {
                    return Err(anyhow::anyhow!(
                        "{INTERVAL_VAR} must be between 1 and {} seconds, got {secs}",
                        MAX_INTERVAL.as_secs()
                    ));
                }
                interval
            }
            None => DEFAULT_INTERVAL,
        };

        Ok(Config {
            api_key,
            connection_string,
            api_base_url,
            interval,
        })
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &"<redacted>")
            .field("connection_string", &self.connection_string)
            .field("api_base_url", &self.api_base_url)
            .field("interval", &self.interval)
            .finish()
    }
}
