use std::env;
use std::time::Duration;

use crate::i18n::Locale;

pub const DEFAULT_CRYPTO_PAY_API_URL: &str = "https://pay.crypt.bot/api";
pub const DEFAULT_SUPPORT_URL: &str = "https://t.me/TradersLiveCommunity";
/// One year; longer grace periods are treated as misconfiguration.
pub const MAX_SWEEP_GRACE_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    Missing(&'static str),
    #[error("environment variable {key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub crypto_bot_token: String,
    pub database_url: String,
    pub group_id: i64,
    pub crypto_pay_api_url: String,
    pub payment_asset: String,
    pub port: u16,
    pub sweep_interval: Duration,
    pub sweep_grace: Duration,
    pub support_url: String,
    pub locale: Locale,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let bot_token = required("BOT_TOKEN")?;
        let crypto_bot_token = required("CRYPTO_BOT_TOKEN")?;
        let database_url = required("DATABASE_URL")?;
        let group_id = parse("GROUP_ID", required("GROUP_ID")?)?;

        let port = get("PORT").map(|v| parse("PORT", v)).transpose()?.unwrap_or(8080);
        let sweep_interval_secs: u64 = get("SWEEP_INTERVAL_SECS")
            .map(|v| parse("SWEEP_INTERVAL_SECS", v))
            .transpose()?
            .unwrap_or(3600);
        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_INTERVAL_SECS",
                value: "0".to_string(),
            });
        }
        let sweep_grace_secs: u64 = get("SWEEP_GRACE_SECS")
            .map(|v| parse("SWEEP_GRACE_SECS", v))
            .transpose()?
            .unwrap_or(0);
        if sweep_grace_secs > MAX_SWEEP_GRACE_SECS {
            return Err(ConfigError::Invalid {
                key: "SWEEP_GRACE_SECS",
                value: sweep_grace_secs.to_string(),
            });
        }
        let http_timeout_secs: u64 = get("HTTP_TIMEOUT_SECS")
            .map(|v| parse("HTTP_TIMEOUT_SECS", v))
            .transpose()?
            .unwrap_or(30);
        let locale = match get("BOT_LOCALE") {
            Some(raw) => Locale::from_code(&raw).ok_or(ConfigError::Invalid {
                key: "BOT_LOCALE",
                value: raw,
            })?,
            None => Locale::Ru,
        };

        Ok(Config {
            bot_token,
            crypto_bot_token,
            database_url,
            group_id,
            crypto_pay_api_url: get("CRYPTO_PAY_API_URL")
                .unwrap_or_else(|| DEFAULT_CRYPTO_PAY_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            payment_asset: get("PAYMENT_ASSET").unwrap_or_else(|| "USDT".to_string()),
            port,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            sweep_grace: Duration::from_secs(sweep_grace_secs),
            support_url: get("SUPPORT_URL").unwrap_or_else(|| DEFAULT_SUPPORT_URL.to_string()),
            locale,
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("BOT_TOKEN", "123:abc"),
        ("CRYPTO_BOT_TOKEN", "crypto"),
        ("DATABASE_URL", "sqlite://bot.db"),
        ("GROUP_ID", "-1001234567890"),
    ];

    #[test]
    fn applies_defaults() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.group_id, -1001234567890);
        assert_eq!(config.crypto_pay_api_url, DEFAULT_CRYPTO_PAY_API_URL);
        assert_eq!(config.payment_asset, "USDT");
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.sweep_grace, Duration::ZERO);
        assert_eq!(config.locale, Locale::Ru);
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn every_required_key_is_checked() {
        for (missing, _) in REQUIRED {
            let pairs: Vec<_> = REQUIRED.iter().copied().filter(|(k, _)| *k != missing).collect();
            match Config::from_lookup(lookup(&pairs)) {
                Err(ConfigError::Missing(key)) => assert_eq!(key, missing),
                other => panic!("expected missing {}, got {:?}", missing, other),
            }
        }
    }

    #[test]
    fn blank_values_count_as_missing() {
        let mut pairs = REQUIRED.to_vec();
        pairs[0] = ("BOT_TOKEN", "   ");
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Missing("BOT_TOKEN"))
        ));
    }

    #[test]
    fn rejects_malformed_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs[3] = ("GROUP_ID", "community");
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { key: "GROUP_ID", .. })
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SWEEP_INTERVAL_SECS", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn rejects_out_of_range_grace() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SWEEP_GRACE_SECS", "18446744073709551615"));
        assert!(matches!(
            Config::from_lookup(lookup(&pairs)),
            Err(ConfigError::Invalid { key: "SWEEP_GRACE_SECS", .. })
        ));

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SWEEP_GRACE_SECS", "86400"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.sweep_grace, Duration::from_secs(86400));
    }

    #[test]
    fn trims_trailing_slash_from_api_url() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("CRYPTO_PAY_API_URL", "https://testnet-pay.crypt.bot/api/"));
        pairs.push(("BOT_LOCALE", "en"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.crypto_pay_api_url, "https://testnet-pay.crypt.bot/api");
        assert_eq!(config.locale, Locale::En);
    }
}
