use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::{SqlitePoolOptions, SqliteConnectOptions, SqliteRow}, Row, SqlitePool};
use std::str::FromStr;

use crate::models::{format_timestamp, parse_timestamp, Exchange, Payment, PaymentStatus, SubscriptionClass, User};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt {column} value in stored row: {value}")]
    Corrupt { column: &'static str, value: String },
    #[error("payment {invoice_id} is not pending")]
    PaymentNotPending { invoice_id: i64 },
    #[error("payment {invoice_id} cannot move back to {status}")]
    IllegalTransition { invoice_id: i64, status: PaymentStatus },
}

/// Durable store for users and their invoices.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, RepositoryError>;

    /// Full-row upsert keyed by `user_id`.
    async fn save_user(&self, user: &User) -> Result<(), RepositoryError>;

    async fn delete_user(&self, user_id: i64) -> Result<(), RepositoryError>;

    /// Users whose subscription ended strictly before `cutoff`.
    async fn get_expired_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>, RepositoryError>;

    async fn save_payment(&self, payment: &Payment) -> Result<(), RepositoryError>;

    /// Only `created -> paid` is accepted.
    async fn update_payment_status(&self, invoice_id: i64, status: PaymentStatus) -> Result<(), RepositoryError>;

    async fn get_payment(&self, invoice_id: i64) -> Result<Option<Payment>, RepositoryError>;

    /// Most recently inserted payment of the user.
    async fn get_last_payment(&self, user_id: i64) -> Result<Option<Payment>, RepositoryError>;

    /// Marks the invoice paid, then stores the extended user.
    async fn confirm_payment(&self, user: &User, invoice_id: i64) -> Result<(), RepositoryError> {
        self.update_payment_status(invoice_id, PaymentStatus::Paid).await?;
        self.save_user(user).await
    }
}

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let connect_opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(connect_opts)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id INTEGER PRIMARY KEY,
            subscription_end TEXT,
            exchange TEXT,
            api_key TEXT,
            username TEXT,
            is_referral INTEGER NOT NULL DEFAULT 0,
            subscription_type TEXT
        );
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_users_subscription_end ON users (subscription_end);",
    )
    .execute(&pool)
    .await?;

    // seq keeps insertion order; payments outlive their users, so no foreign key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS payments (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            invoice_id INTEGER NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            pricing_class TEXT NOT NULL DEFAULT 'regular',
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('created', 'paid')),
            created_at TEXT NOT NULL
        );
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_payments_user ON payments (user_id, seq);",
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

const USER_COLUMNS: &str = "user_id, subscription_end, exchange, api_key, username, subscription_type";
const PAYMENT_COLUMNS: &str = "invoice_id, user_id, pricing_class, amount, currency, status, created_at";

const UPSERT_USER: &str = r#"
    INSERT INTO users (user_id, subscription_end, exchange, api_key, username, is_referral, subscription_type)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (user_id)
    DO UPDATE SET subscription_end = excluded.subscription_end,
                  exchange = excluded.exchange,
                  api_key = excluded.api_key,
                  username = excluded.username,
                  is_referral = excluded.is_referral,
                  subscription_type = excluded.subscription_type
"#;

const MARK_PAID: &str = "UPDATE payments SET status = 'paid' WHERE invoice_id = ? AND status = 'created'";

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn corrupt(column: &'static str, value: impl Into<String>) -> RepositoryError {
    RepositoryError::Corrupt { column, value: value.into() }
}

fn user_from_row(row: &SqliteRow) -> Result<User, RepositoryError> {
    let subscription_end = row
        .try_get::<Option<String>, _>("subscription_end")?
        .map(|raw| parse_timestamp(&raw).map_err(|_| corrupt("subscription_end", raw)))
        .transpose()?;
    let subscription_type = row
        .try_get::<Option<String>, _>("subscription_type")?
        .map(|raw| raw.parse::<SubscriptionClass>().map_err(|_| corrupt("subscription_type", raw)))
        .transpose()?;
    let exchange = row
        .try_get::<Option<String>, _>("exchange")?
        .map(|raw| raw.parse::<Exchange>().map_err(|_| corrupt("exchange", raw)))
        .transpose()?;

    Ok(User::from_parts(
        row.try_get::<i64, _>("user_id")?,
        row.try_get::<Option<String>, _>("username")?,
        subscription_end,
        subscription_type,
        exchange,
        row.try_get::<Option<String>, _>("api_key")?,
    ))
}

fn payment_from_row(row: &SqliteRow) -> Result<Payment, RepositoryError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let pricing_class: String = row.try_get("pricing_class")?;
    Ok(Payment {
        invoice_id: row.try_get("invoice_id")?,
        user_id: row.try_get("user_id")?,
        pricing_class: pricing_class
            .parse::<SubscriptionClass>()
            .map_err(|_| corrupt("pricing_class", pricing_class.clone()))?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        status: status.parse::<PaymentStatus>().map_err(|_| corrupt("status", status.clone()))?,
        created_at: parse_timestamp(&created_at).map_err(|_| corrupt("created_at", created_at.clone()))?,
    })
}

fn bind_user<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    user: &User,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(user.user_id)
        .bind(user.subscription_end.map(format_timestamp))
        .bind(user.exchange().map(|e| e.as_str().to_string()))
        .bind(user.api_key().map(str::to_string))
        .bind(user.username.clone())
        .bind(user.is_referral())
        .bind(user.subscription_type.map(|c| c.as_str().to_string()))
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_user(&self, user_id: i64) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE user_id = ? LIMIT 1", USER_COLUMNS))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_user(&self, user: &User) -> Result<(), RepositoryError> {
        bind_user(sqlx::query(UPSERT_USER), user)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM users WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_expired_users(&self, cutoff: DateTime<Utc>) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM users WHERE subscription_end IS NOT NULL AND subscription_end < ? ORDER BY subscription_end",
            USER_COLUMNS
        ))
        .bind(format_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn save_payment(&self, payment: &Payment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO payments (invoice_id, user_id, pricing_class, amount, currency, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(payment.invoice_id)
        .bind(payment.user_id)
        .bind(payment.pricing_class.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status.as_str())
        .bind(format_timestamp(payment.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_payment_status(&self, invoice_id: i64, status: PaymentStatus) -> Result<(), RepositoryError> {
        if status != PaymentStatus::Paid {
            return Err(RepositoryError::IllegalTransition { invoice_id, status });
        }
        let result = sqlx::query(MARK_PAID)
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::PaymentNotPending { invoice_id });
        }
        Ok(())
    }

    async fn get_payment(&self, invoice_id: i64) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM payments WHERE invoice_id = ? LIMIT 1", PAYMENT_COLUMNS))
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn get_last_payment(&self, user_id: i64) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM payments WHERE user_id = ? ORDER BY seq DESC LIMIT 1",
            PAYMENT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn confirm_payment(&self, user: &User, invoice_id: i64) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(MARK_PAID)
            .bind(invoice_id)
            .execute(&mut tx)
            .await?;
        if flipped.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::PaymentNotPending { invoice_id });
        }

        bind_user(sqlx::query(UPSERT_USER), user)
            .execute(&mut tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
