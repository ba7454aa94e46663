pub mod user;
pub mod payment;
pub mod tariff;

pub use user::{User, Exchange, format_timestamp, parse_timestamp};
pub use payment::{Payment, PaymentStatus};
pub use tariff::{Tariff, TariffCatalog, SubscriptionClass};
