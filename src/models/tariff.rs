use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Absolute tolerance used when matching a paid amount back to a tariff price.
pub const PRICE_TOLERANCE: f64 = 0.01;

/// Pricing bucket a user is placed in before choosing a tariff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionClass {
    Regular,
    Referral,
}

impl SubscriptionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionClass::Regular => "regular",
            SubscriptionClass::Referral => "referral",
        }
    }
}

impl fmt::Display for SubscriptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Ok(SubscriptionClass::Regular),
            "referral" => Ok(SubscriptionClass::Referral),
            other => Err(format!("unknown subscription class: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tariff {
    pub id: &'static str,
    pub days: i64,
    pub price: f64,
    pub name: &'static str,
}

/// Immutable tariff tables, one per subscription class, sharing the same ids.
#[derive(Debug, Clone)]
pub struct TariffCatalog {
    regular: Vec<Tariff>,
    referral: Vec<Tariff>,
}

impl TariffCatalog {
    pub fn new(regular: Vec<Tariff>, referral: Vec<Tariff>) -> Self {
        Self { regular, referral }
    }

    /// The catalog the community sells. Referral prices are 10% off regular,
    /// the one-day trial costs the same in both classes.
    pub fn standard() -> Self {
        let regular = vec![
            Tariff { id: "test", days: 1, price: 5.0, name: "Trial (1 day)" },
            Tariff { id: "1month", days: 30, price: 70.0, name: "1 month" },
            Tariff { id: "3months", days: 90, price: 180.0, name: "3 months (save $30)" },
            Tariff { id: "6months", days: 180, price: 320.0, name: "6 months (save $100)" },
            Tariff { id: "12months", days: 365, price: 600.0, name: "12 months (save $240)" },
        ];
        let referral = vec![
            Tariff { id: "test", days: 1, price: 5.0, name: "Trial (1 day)" },
            Tariff { id: "1month", days: 30, price: 63.0, name: "1 month" },
            Tariff { id: "3months", days: 90, price: 162.0, name: "3 months (save $27)" },
            Tariff { id: "6months", days: 180, price: 288.0, name: "6 months (save $90)" },
            Tariff { id: "12months", days: 365, price: 540.0, name: "12 months (save $216)" },
        ];
        Self::new(regular, referral)
    }

    pub fn tariffs(&self, class: SubscriptionClass) -> &[Tariff] {
        match class {
            SubscriptionClass::Regular => &self.regular,
            SubscriptionClass::Referral => &self.referral,
        }
    }

    pub fn tariff(&self, class: SubscriptionClass, tariff_id: &str) -> Option<&Tariff> {
        self.tariffs(class).iter().find(|t| t.id == tariff_id)
    }

    /// Reverse lookup from a paid amount to the tariff it buys.
    pub fn resolve_by_price(&self, class: SubscriptionClass, amount: f64) -> Option<&Tariff> {
        if !amount.is_finite() {
            return None;
        }
        self.tariffs(class)
            .iter()
            .find(|t| (t.price - amount).abs() <= PRICE_TOLERANCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_tariffs_per_class() {
        let catalog = TariffCatalog::standard();

        let regular = catalog.tariff(SubscriptionClass::Regular, "1month").unwrap();
        assert_eq!(regular.days, 30);
        assert_eq!(regular.price, 70.0);

        let referral = catalog.tariff(SubscriptionClass::Referral, "1month").unwrap();
        assert_eq!(referral.days, 30);
        assert!(referral.price < regular.price);

        assert!(catalog.tariff(SubscriptionClass::Regular, "2weeks").is_none());
    }

    #[test]
    fn both_classes_share_tariff_ids() {
        let catalog = TariffCatalog::standard();
        let regular: Vec<_> = catalog.tariffs(SubscriptionClass::Regular).iter().map(|t| t.id).collect();
        let referral: Vec<_> = catalog.tariffs(SubscriptionClass::Referral).iter().map(|t| t.id).collect();
        assert_eq!(regular, referral);
    }

    #[test]
    fn reverse_lookup_tolerates_rounding_noise() {
        let catalog = TariffCatalog::standard();

        for amount in [70.0, 69.999, 70.004] {
            let tariff = catalog.resolve_by_price(SubscriptionClass::Regular, amount);
            assert_eq!(tariff.map(|t| t.id), Some("1month"), "amount {}", amount);
        }

        assert!(catalog.resolve_by_price(SubscriptionClass::Regular, 71.5).is_none());
        assert!(catalog.resolve_by_price(SubscriptionClass::Regular, 70.02).is_none());
        assert!(catalog.resolve_by_price(SubscriptionClass::Regular, f64::NAN).is_none());
    }

    #[test]
    fn reverse_lookup_uses_the_class_table() {
        let catalog = TariffCatalog::standard();
        assert_eq!(
            catalog.resolve_by_price(SubscriptionClass::Referral, 63.0).map(|t| t.id),
            Some("1month")
        );
        assert!(catalog.resolve_by_price(SubscriptionClass::Regular, 63.0).is_none());
    }

    #[test]
    fn parses_subscription_class() {
        assert_eq!("Referral".parse::<SubscriptionClass>(), Ok(SubscriptionClass::Referral));
        assert_eq!(" regular ".parse::<SubscriptionClass>(), Ok(SubscriptionClass::Regular));
        assert!("vip".parse::<SubscriptionClass>().is_err());
    }
}
