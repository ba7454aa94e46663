use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::SubscriptionClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Paid => "paid",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PaymentStatus::Created),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(format!("unknown payment status: {}", other)),
        }
    }
}

/// One gateway invoice issued to a user. Only `status` ever changes after insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub invoice_id: i64,
    pub user_id: i64,
    /// Price table the invoice was issued from; the paid amount is resolved against it.
    pub pricing_class: SubscriptionClass,
    pub amount: f64,
    pub currency: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn new(
        invoice_id: i64,
        user_id: i64,
        pricing_class: SubscriptionClass,
        amount: f64,
        currency: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            invoice_id,
            user_id,
            pricing_class,
            amount,
            currency: currency.to_string(),
            status: PaymentStatus::Created,
            created_at,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.status == PaymentStatus::Paid
    }
}
