//! In-memory doubles for the repository, gateway, clock and messenger.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::Config;
use crate::db::{Repository, RepositoryError};
use crate::models::{Payment, PaymentStatus, TariffCatalog, User};
use crate::services::crypto_pay::{GatewayError, Invoice, InvoiceState, InvoiceStatus, PaymentGateway};
use crate::services::subscription::{Clock, Messenger, MessengerError, SubscriptionEngine};
use crate::services::telegram::TelegramBot;
use crate::state::AppState;

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 15, 10, 30, 0).unwrap()
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Default)]
pub struct InMemoryRepository {
    users: Mutex<HashMap<i64, User>>,
    payments: Mutex<Vec<Payment>>,
    writes: AtomicUsize,
    fail_status_updates: AtomicBool,
    fail_user_saves: AtomicBool,
}

impl InMemoryRepository {
    /// Seeds a row without counting it as a write.
    pub fn insert_user(&self, user: User) {
        self.users.lock().unwrap().insert(user.user_id, user);
    }

    pub fn user(&self, user_id: i64) -> Option<User> {
        self.users.lock().unwrap().get(&user_id).cloned()
    }

    pub fn payment(&self, invoice_id: i64) -> Option<Payment> {
        self.payments.lock().unwrap().iter().find(|p| p.invoice_id == invoice_id).cloned()
    }

    pub fn payments_of(&self, user_id: i64) -> Vec<Payment> {
        self.payments.lock().unwrap().iter().filter(|p| p.user_id == user_id).cloned().collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_status_updates(&self) {
        self.fail_status_updates.store(true, Ordering::SeqCst);
    }

    pub fn fail_user_saves(&self, fail: bool) {
        self.fail_user_saves.store(fail, Ordering::SeqCst);
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, RepositoryError> {
        Ok(self.user(user_id))
    }

    async fn save_user(&self, user: &User) -> Result<(), RepositoryError> {
        if self.fail_user_saves.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        self.wrote();
        self.users.lock().unwrap().insert(user.user_id, user.clone());
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<(), RepositoryError> {
        self.wrote();
        self.users.lock().unwrap().remove(&user_id);
        Ok(())
    }

    async fn get_expired_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>, RepositoryError> {
        let mut expired: Vec<User> = self
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|u| matches!(u.subscription_end, Some(end) if end < cutoff))
            .cloned()
            .collect();
        expired.sort_by_key(|u| u.user_id);
        Ok(expired)
    }

    async fn save_payment(&self, payment: &Payment) -> Result<(), RepositoryError> {
        self.wrote();
        self.payments.lock().unwrap().push(payment.clone());
        Ok(())
    }

    async fn update_payment_status(&self, invoice_id: i64, status: PaymentStatus) -> Result<(), RepositoryError> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        if status != PaymentStatus::Paid {
            return Err(RepositoryError::IllegalTransition { invoice_id, status });
        }
        self.wrote();
        let mut payments = self.payments.lock().unwrap();
        match payments.iter_mut().find(|p| p.invoice_id == invoice_id && !p.is_paid()) {
            Some(payment) => {
                payment.status = PaymentStatus::Paid;
                Ok(())
            }
            None => Err(RepositoryError::PaymentNotPending { invoice_id }),
        }
    }

    async fn get_payment(&self, invoice_id: i64) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payment(invoice_id))
    }

    async fn get_last_payment(&self, user_id: i64) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payments_of(user_id).pop())
    }
}

/// Gateway whose invoices stay unpaid until a test marks them paid.
pub struct ScriptedGateway {
    next_id: AtomicI64,
    paid: Mutex<HashMap<i64, f64>>,
    created: AtomicUsize,
    checks: AtomicUsize,
    fail_create: AtomicBool,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            paid: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
        }
    }
}

impl ScriptedGateway {
    pub fn mark_paid(&self, invoice_id: i64, amount: f64) {
        self.paid.lock().unwrap().insert(invoice_id, amount);
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_invoice(&self, _user_id: i64, _amount: f64, _description: &str) -> Result<Invoice, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Malformed("missing result".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let invoice_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Invoice {
            invoice_id,
            pay_url: format!("https://t.me/CryptoBot?start=IV{}", invoice_id),
        })
    }

    async fn check_invoice(&self, invoice_id: i64) -> Result<InvoiceState, GatewayError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(match self.paid.lock().unwrap().get(&invoice_id) {
            Some(amount) => InvoiceState { status: InvoiceStatus::Paid, amount: *amount },
            None => InvoiceState { status: InvoiceStatus::Unpaid, amount: 0.0 },
        })
    }

    fn asset(&self) -> &str {
        "USDT"
    }
}

#[derive(Default)]
pub struct RecordingMessenger {
    notified: Mutex<Vec<(i64, String)>>,
    removed: Mutex<Vec<i64>>,
    fail_notifications: AtomicBool,
    fail_removal: Mutex<HashSet<i64>>,
}

impl RecordingMessenger {
    pub fn fail_notifications(&self) {
        self.fail_notifications.store(true, Ordering::SeqCst);
    }

    pub fn fail_removal_for(&self, user_id: i64) {
        self.fail_removal.lock().unwrap().insert(user_id);
    }

    pub fn notified(&self) -> Vec<i64> {
        self.notified.lock().unwrap().iter().map(|(user_id, _)| *user_id).collect()
    }

    pub fn notices(&self) -> Vec<(i64, String)> {
        self.notified.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn notify(&self, user_id: i64, text: &str) -> Result<(), MessengerError> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(MessengerError("Forbidden: bot was blocked by the user".to_string()));
        }
        self.notified.lock().unwrap().push((user_id, text.to_string()));
        Ok(())
    }

    async fn remove_from_group(&self, user_id: i64) -> Result<(), MessengerError> {
        if self.fail_removal.lock().unwrap().contains(&user_id) {
            return Err(MessengerError("Bad Request: not enough rights".to_string()));
        }
        self.removed.lock().unwrap().push(user_id);
        Ok(())
    }
}

pub const CRYPTO_TOKEN: &str = "12345:crypto-test-token";
pub const SUPPORT_URL: &str = "https://t.me/test_support";

/// Application state wired to in-memory doubles. The Telegram client points
/// at the real API with a test token, so only paths that skip it are usable.
pub struct TestApp {
    pub state: AppState,
    pub repo: Arc<InMemoryRepository>,
    pub gateway: Arc<ScriptedGateway>,
    pub messenger: Arc<RecordingMessenger>,
}

pub fn test_app() -> TestApp {
    let vars: HashMap<&str, &str> = [
        ("BOT_TOKEN", "1:bot"),
        ("CRYPTO_BOT_TOKEN", CRYPTO_TOKEN),
        ("DATABASE_URL", "sqlite::memory:"),
        ("GROUP_ID", "-1001"),
        ("BOT_LOCALE", "en"),
        ("SUPPORT_URL", SUPPORT_URL),
    ]
    .into_iter()
    .collect();
    let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

    let repo = Arc::new(InMemoryRepository::default());
    let gateway = Arc::new(ScriptedGateway::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let engine = SubscriptionEngine::new(
        repo.clone(),
        gateway.clone(),
        Arc::new(TariffCatalog::standard()),
        Arc::new(FixedClock(fixed_now())),
    );
    let telegram = TelegramBot::new(&config.bot_token, config.group_id, Duration::from_secs(1)).unwrap();
    let state = AppState::new(Arc::new(engine), Arc::new(telegram), Arc::new(config))
        .with_messenger(messenger.clone());
    TestApp { state, repo, gateway, messenger }
}

/// Signature the gateway would put on `body` for the given API token.
pub fn sign_webhook(token: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(&Sha256::digest(token.as_bytes())).unwrap();
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
