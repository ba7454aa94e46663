//! Subscription lifecycle: class and tariff selection, invoice creation,
//! payment reconciliation and expiry sweeping.
//!
//! The engine keeps no conversational state. Everything it knows lives in the
//! user and payment rows, and every read-modify-write of one user runs under
//! that user's lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::db::{Repository, RepositoryError};
use crate::models::{Exchange, Payment, SubscriptionClass, Tariff, TariffCatalog, User};
use crate::services::crypto_pay::{GatewayError, InvoiceStatus, PaymentGateway};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MessengerError(pub String);

/// Outbound side of the chat platform, as far as the sweep needs it.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn notify(&self, user_id: i64, text: &str) -> Result<(), MessengerError>;
    async fn remove_from_group(&self, user_id: i64) -> Result<(), MessengerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Gateway,
    Repository,
    TariffResolution,
    Platform,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown tariff {0}")]
    InvalidTariff(String),
    #[error("unsupported exchange {0}")]
    UnsupportedExchange(String),
    #[error("API key is empty")]
    EmptyApiKey,
    #[error("exchange is already set")]
    ExchangeAlreadySet,
    #[error("subscription class can't change while the subscription is active")]
    ClassLocked,
    #[error("user {0} has no payment")]
    NoPayment(i64),
    #[error("unknown invoice {0}")]
    UnknownInvoice(i64),
    #[error("paid amount {amount} of invoice {invoice_id} matches no tariff")]
    TariffResolution { invoice_id: i64, user_id: i64, amount: f64 },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("chat platform error: {0}")]
    Messenger(#[from] MessengerError),
    #[error("failed to record confirmed payment for invoice {invoice_id}: {source}")]
    ConfirmationFailed {
        invoice_id: i64,
        #[source]
        source: RepositoryError,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidTariff(_)
            | EngineError::UnsupportedExchange(_)
            | EngineError::EmptyApiKey
            | EngineError::ExchangeAlreadySet
            | EngineError::ClassLocked => ErrorKind::Validation,
            EngineError::NoPayment(_) | EngineError::UnknownInvoice(_) => ErrorKind::NotFound,
            EngineError::Gateway(_) => ErrorKind::Gateway,
            EngineError::Repository(_) | EngineError::ConfirmationFailed { .. } => ErrorKind::Repository,
            EngineError::TariffResolution { .. } => ErrorKind::TariffResolution,
            EngineError::Messenger(_) => ErrorKind::Platform,
        }
    }
}

/// What the user needs in order to pay.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceTicket {
    pub invoice_id: i64,
    pub pay_url: String,
    pub tariff: Tariff,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    NotYetPaid,
    Confirmed {
        expires_at: DateTime<Utc>,
        tariff: Tariff,
        needs_exchange_setup: bool,
    },
    /// The invoice was already reconciled earlier; nothing was written.
    AlreadyConfirmed {
        expires_at: Option<DateTime<Utc>>,
        needs_exchange_setup: bool,
    },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub removed: Vec<i64>,
    pub failed: Vec<i64>,
}

/// One async mutex per user id.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl UserLocks {
    const PRUNE_ABOVE: usize = 1024;

    pub async fn lock(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            if locks.len() > Self::PRUNE_ABOVE {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

pub struct SubscriptionEngine {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<TariffCatalog>,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
}

impl SubscriptionEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<TariffCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            gateway,
            catalog,
            clock,
            locks: UserLocks::default(),
        }
    }

    pub fn catalog(&self) -> &TariffCatalog {
        &self.catalog
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn user(&self, user_id: i64) -> Result<Option<User>, EngineError> {
        Ok(self.repo.get_user(user_id).await?)
    }

    /// Creates the user on first contact and refreshes the username afterwards.
    pub async fn touch_user(&self, user_id: i64, username: Option<&str>) -> Result<User, EngineError> {
        let _guard = self.locks.lock(user_id).await;
        let username = username.map(str::to_string);
        match self.repo.get_user(user_id).await? {
            Some(user) if user.username == username => Ok(user),
            Some(mut user) => {
                user.username = username;
                self.repo.save_user(&user).await?;
                Ok(user)
            }
            None => {
                let user = User::new(user_id, username);
                self.repo.save_user(&user).await?;
                info!(user_id, "registered new user");
                Ok(user)
            }
        }
    }

    pub async fn select_subscription_type(
        &self,
        user_id: i64,
        class: SubscriptionClass,
    ) -> Result<User, EngineError> {
        let _guard = self.locks.lock(user_id).await;
        let mut user = self
            .repo
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id, None));

        if user.subscription_type == Some(class) {
            return Ok(user);
        }
        if user.is_active(self.clock.now()) && user.pricing_class() != class {
            return Err(EngineError::ClassLocked);
        }

        user.subscription_type = Some(class);
        self.repo.save_user(&user).await?;
        info!(user_id, class = %class, "subscription class selected");
        Ok(user)
    }

    /// Issues exactly one gateway invoice for the tariff and records it as created.
    pub async fn select_tariff(&self, user_id: i64, tariff_id: &str) -> Result<InvoiceTicket, EngineError> {
        let _guard = self.locks.lock(user_id).await;
        let class = self
            .repo
            .get_user(user_id)
            .await?
            .map(|u| u.pricing_class())
            .unwrap_or(SubscriptionClass::Regular);
        let tariff = self
            .catalog
            .tariff(class, tariff_id)
            .ok_or_else(|| EngineError::InvalidTariff(tariff_id.to_string()))?
            .clone();

        let description = format!("Subscription: {} ({} days)", tariff.name, tariff.days);
        let invoice = self
            .gateway
            .create_invoice(user_id, tariff.price, &description)
            .await
            .map_err(|e| {
                error!(user_id, tariff = tariff.id, error = %e, "failed to create invoice");
                e
            })?;

        let payment = Payment::new(
            invoice.invoice_id,
            user_id,
            class,
            tariff.price,
            self.gateway.asset(),
            self.clock.now(),
        );
        self.repo.save_payment(&payment).await?;
        info!(user_id, invoice_id = invoice.invoice_id, tariff = tariff.id, amount = tariff.price, "invoice created");

        Ok(InvoiceTicket {
            invoice_id: invoice.invoice_id,
            pay_url: invoice.pay_url,
            tariff,
            currency: payment.currency,
        })
    }

    /// Reconciles the user's most recent invoice with the gateway.
    pub async fn check_payment(&self, user_id: i64, tariff_hint: Option<&str>) -> Result<PaymentOutcome, EngineError> {
        let _guard = self.locks.lock(user_id).await;
        let payment = self
            .repo
            .get_last_payment(user_id)
            .await?
            .ok_or(EngineError::NoPayment(user_id))?;
        self.reconcile(payment, tariff_hint).await
    }

    /// Same reconciliation keyed by invoice id, for gateway callbacks.
    pub async fn check_invoice_payment(&self, invoice_id: i64) -> Result<(i64, PaymentOutcome), EngineError> {
        let user_id = self
            .repo
            .get_payment(invoice_id)
            .await?
            .ok_or(EngineError::UnknownInvoice(invoice_id))?
            .user_id;

        let _guard = self.locks.lock(user_id).await;
        // re-read under the lock; a concurrent check may have confirmed it
        let payment = self
            .repo
            .get_payment(invoice_id)
            .await?
            .ok_or(EngineError::UnknownInvoice(invoice_id))?;
        let outcome = self.reconcile(payment, None).await?;
        Ok((user_id, outcome))
    }

    async fn reconcile(&self, payment: Payment, tariff_hint: Option<&str>) -> Result<PaymentOutcome, EngineError> {
        let user_id = payment.user_id;
        let invoice_id = payment.invoice_id;
        let stored = self.repo.get_user(user_id).await?;

        if payment.is_paid() {
            debug!(user_id, invoice_id, "invoice already confirmed");
            return Ok(PaymentOutcome::AlreadyConfirmed {
                expires_at: stored.as_ref().and_then(|u| u.subscription_end),
                needs_exchange_setup: stored.as_ref().map_or(true, |u| u.needs_exchange_setup()),
            });
        }

        let state = self.gateway.check_invoice(invoice_id).await.map_err(|e| {
            error!(user_id, invoice_id, error = %e, "failed to check invoice");
            e
        })?;
        if state.status != InvoiceStatus::Paid {
            debug!(user_id, invoice_id, "invoice not paid yet");
            return Ok(PaymentOutcome::NotYetPaid);
        }

        let mut user = stored.unwrap_or_else(|| User::new(user_id, None));
        // the class may have changed, or the row been swept, since the invoice was issued
        let tariff = self
            .catalog
            .resolve_by_price(payment.pricing_class, state.amount)
            .ok_or_else(|| {
                error!(user_id, invoice_id, amount = state.amount, "paid amount matches no tariff");
                EngineError::TariffResolution { invoice_id, user_id, amount: state.amount }
            })?
            .clone();
        if let Some(hint) = tariff_hint {
            if hint != tariff.id {
                warn!(user_id, invoice_id, hint, resolved = tariff.id, "tariff hint differs from paid tariff");
            }
        }

        if user.subscription_type.is_none() {
            user.subscription_type = Some(payment.pricing_class);
        }
        let expires_at = user.extend_subscription(tariff.days, self.clock.now());
        self.repo
            .confirm_payment(&user, invoice_id)
            .await
            .map_err(|source| {
                error!(user_id, invoice_id, error = %source, "failed to record confirmed payment");
                EngineError::ConfirmationFailed { invoice_id, source }
            })?;

        info!(user_id, invoice_id, tariff = tariff.id, expires_at = %expires_at, "payment confirmed");
        Ok(PaymentOutcome::Confirmed {
            expires_at,
            tariff,
            needs_exchange_setup: user.needs_exchange_setup(),
        })
    }

    /// Stores exchange and API key together in a single row write.
    pub async fn save_exchange_and_api_key(
        &self,
        user_id: i64,
        exchange: &str,
        api_key: &str,
    ) -> Result<User, EngineError> {
        let exchange: Exchange = exchange
            .parse()
            .map_err(|_| EngineError::UnsupportedExchange(exchange.trim().to_string()))?;
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(EngineError::EmptyApiKey);
        }

        let _guard = self.locks.lock(user_id).await;
        let mut user = self
            .repo
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| User::new(user_id, None));
        if user.exchange().is_some() {
            return Err(EngineError::ExchangeAlreadySet);
        }

        user.set_exchange_credentials(exchange, api_key.to_string());
        self.repo.save_user(&user).await?;
        info!(user_id, exchange = %exchange, "exchange and API key saved");
        Ok(user)
    }

    pub async fn clear_exchange(&self, user_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.lock(user_id).await;
        if let Some(mut user) = self.repo.get_user(user_id).await? {
            if user.exchange().is_some() {
                user.clear_exchange();
                self.repo.save_user(&user).await?;
                info!(user_id, "exchange cleared");
            }
        }
        Ok(())
    }

    /// Drops the user row, e.g. after the user blocked the bot.
    pub async fn forget_user(&self, user_id: i64) -> Result<(), EngineError> {
        let _guard = self.locks.lock(user_id).await;
        self.repo.delete_user(user_id).await?;
        info!(user_id, "user removed");
        Ok(())
    }

    /// Revokes access for every user whose subscription ended more than
    /// `grace` ago. Failures stay local to the user they happened for.
    pub async fn sweep_expired(
        &self,
        messenger: &dyn Messenger,
        notice: &str,
        grace: Duration,
    ) -> Result<SweepReport, EngineError> {
        let Some(cutoff) = chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| self.clock.now().checked_sub_signed(grace))
        else {
            warn!(grace_secs = grace.as_secs(), "sweep grace period out of range, skipping sweep");
            return Ok(SweepReport::default());
        };
        let expired = self.repo.get_expired_users(cutoff).await?;
        let mut report = SweepReport::default();

        for candidate in expired {
            let user_id = candidate.user_id;
            match self.expire_user(user_id, cutoff, messenger, notice).await {
                Ok(true) => report.removed.push(user_id),
                Ok(false) => {}
                Err(e) => {
                    error!(user_id, error = %e, "failed to expire user");
                    report.failed.push(user_id);
                }
            }
        }

        Ok(report)
    }

    async fn expire_user(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
        messenger: &dyn Messenger,
        notice: &str,
    ) -> Result<bool, EngineError> {
        let _guard = self.locks.lock(user_id).await;
        // the user may have paid since the batch was loaded
        let still_expired = self
            .repo
            .get_user(user_id)
            .await?
            .and_then(|u| u.subscription_end)
            .map_or(false, |end| end < cutoff);
        if !still_expired {
            debug!(user_id, "user renewed before sweep");
            return Ok(false);
        }

        if let Err(e) = messenger.notify(user_id, notice).await {
            warn!(user_id, error = %e, "failed to notify expired user");
        }
        if let Err(e) = messenger.remove_from_group(user_id).await {
            // keep the row so the next sweep retries the removal
            return Err(e.into());
        }

        self.repo.delete_user(user_id).await?;
        info!(user_id, "expired subscription revoked");
        Ok(true)
    }
}
