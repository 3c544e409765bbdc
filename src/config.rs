use crate::errors::Error;
use crate::models::Money;
use chrono::NaiveTime;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub sc_rpc_client: ScRpcClientConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub currencies: Vec<CurrencyConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ScRpcClientConfig {
    pub rpc_url: String,
    pub rpc_signature: String,
    #[serde(default = "default_max_age")]
    pub max_age: i64,
    #[serde(default = "default_min_confirms")]
    pub min_confirms: i64,
    #[serde(default = "default_minimum_tx_output")]
    pub minimum_tx_output: Money,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct CurrencyConfig {
    pub currency_code: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub valid_address_versions: Vec<u8>,
    pub coinserv: CoinservConfig,
    /// Fixed fee handed to `settxfee` before each send, if the network
    /// needs one pinned.
    #[serde(default)]
    pub payout_fee: Option<Money>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinservConfig {
    pub username: String,
    pub password: String,
    pub address: String,
    pub port: u16,
    pub account: String,
    #[serde(default)]
    pub wallet_pass: String,
}

/// Per-currency settlement calendar, UTC.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_pull_minutes")]
    pub pull_minutes: u32,
    #[serde(default = "default_send_at", deserialize_with = "de_hhmm")]
    pub send_at: NaiveTime,
    #[serde(default = "default_associate_at", deserialize_with = "de_hhmm")]
    pub associate_at: NaiveTime,
    #[serde(default = "default_confirm_at", deserialize_with = "de_hhmm")]
    pub confirm_at: NaiveTime,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            pull_minutes: default_pull_minutes(),
            send_at: default_send_at(),
            associate_at: default_associate_at(),
            confirm_at: default_confirm_at(),
        }
    }
}

fn default_log_level() -> String {
    s!("info")
}

fn default_max_age() -> i64 {
    10
}

fn default_min_confirms() -> i64 {
    12
}

fn default_minimum_tx_output() -> Money {
    Money::from_atomic(1)
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_pull_minutes() -> u32 {
    1
}

fn default_send_at() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 0, 0).expect("constant time")
}

fn default_associate_at() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).expect("constant time")
}

fn default_confirm_at() -> NaiveTime {
    NaiveTime::from_hms_opt(1, 0, 0).expect("constant time")
}

fn de_hhmm<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
    let text = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&text, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&text, "%H:%M:%S"))
        .map_err(|_| serde::de::Error::custom(format!("not a HH:MM time: {:?}", text)))
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Error> {
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {}", path.display(), e)))?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.sc_rpc_client.rpc_signature.is_empty() {
            return Err(Error::Config(s!("rpc_signature must not be empty")));
        }
        if self.sc_rpc_client.rpc_url.is_empty() {
            return Err(Error::Config(s!("rpc_url must not be empty")));
        }
        if !self.sc_rpc_client.minimum_tx_output.is_positive() {
            return Err(Error::Config(s!("minimum_tx_output must be positive")));
        }
        if self.currencies.is_empty() {
            return Err(Error::Config(s!("at least one currency must be configured")));
        }
        let mut seen = HashSet::new();
        for currency in &self.currencies {
            if !seen.insert(currency.currency_code.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate currency {}",
                    currency.currency_code
                )));
            }
            if currency.enabled && currency.valid_address_versions.is_empty() {
                return Err(Error::Config(format!(
                    "{} is enabled but lists no valid_address_versions",
                    currency.currency_code
                )));
            }
        }
        Ok(())
    }

    /// Look up an enabled currency for the operator CLIs.
    pub fn currency(&self, code: &str) -> Result<&CurrencyConfig, Error> {
        let currency = self
            .currencies
            .iter()
            .find(|c| c.currency_code == code)
            .ok_or_else(|| Error::Config(format!("currency {} is not configured", code)))?;
        if !currency.enabled {
            return Err(Error::Config(format!("currency {} is disabled", code)));
        }
        Ok(currency)
    }

    pub fn enabled_currencies(&self) -> impl Iterator<Item = &CurrencyConfig> {
        self.currencies.iter().filter(|c| c.enabled)
    }
}
