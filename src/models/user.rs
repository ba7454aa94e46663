use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::tariff::SubscriptionClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exchange {
    Binance,
    Bybit,
    #[serde(rename = "OKX")]
    Okx,
    BingX,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [Exchange::Binance, Exchange::Bybit, Exchange::Okx, Exchange::BingX];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "Binance",
            Exchange::Bybit => "Bybit",
            Exchange::Okx => "OKX",
            Exchange::BingX => "BingX",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Exchange::ALL
            .iter()
            .copied()
            .find(|e| e.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unsupported exchange: {}", wanted))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub subscription_type: Option<SubscriptionClass>,
    exchange: Option<Exchange>,
    #[serde(skip_serializing)]
    api_key: Option<String>,
}

impl User {
    pub fn new(user_id: i64, username: Option<String>) -> Self {
        Self {
            user_id,
            username,
            subscription_end: None,
            subscription_type: None,
            exchange: None,
            api_key: None,
        }
    }

    /// Rebuilds a stored row. An API key without an exchange is dropped so the
    /// pair invariant holds for every value in memory.
    pub fn from_parts(
        user_id: i64,
        username: Option<String>,
        subscription_end: Option<DateTime<Utc>>,
        subscription_type: Option<SubscriptionClass>,
        exchange: Option<Exchange>,
        api_key: Option<String>,
    ) -> Self {
        let api_key = if exchange.is_some() { api_key } else { None };
        Self {
            user_id,
            username,
            subscription_end,
            subscription_type,
            exchange,
            api_key,
        }
    }

    pub fn exchange(&self) -> Option<Exchange> {
        self.exchange
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn is_referral(&self) -> bool {
        self.subscription_type == Some(SubscriptionClass::Referral)
    }

    /// Class used for pricing; users who never chose pay regular prices.
    pub fn pricing_class(&self) -> SubscriptionClass {
        self.subscription_type.unwrap_or(SubscriptionClass::Regular)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.subscription_end, Some(end) if end > now)
    }

    pub fn needs_exchange_setup(&self) -> bool {
        self.exchange.is_none()
    }

    /// Adds `days` on top of the remaining time, or starting from `now` when
    /// the subscription is missing or already over.
    pub fn extend_subscription(&mut self, days: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = match self.subscription_end {
            Some(end) if end > now => end,
            _ => now,
        };
        let end = base + Duration::days(days);
        self.subscription_end = Some(end);
        end
    }

    pub fn set_exchange_credentials(&mut self, exchange: Exchange, api_key: String) {
        self.exchange = Some(exchange);
        self.api_key = Some(api_key);
    }

    pub fn clear_exchange(&mut self) {
        self.exchange = None;
        self.api_key = None;
    }
}

/// Fixed-width UTC form so that stored timestamps sort lexically.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}
