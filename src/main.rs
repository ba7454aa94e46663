mod config;
mod db;
mod handlers;
mod i18n;
mod models;
mod services;
mod state;

use actix_web::middleware::NormalizePath;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use db::SqliteRepository;
use models::TariffCatalog;
use services::crypto_pay::CryptoPayClient;
use services::subscription::{SubscriptionEngine, SystemClock};
use services::sweep::ExpirySweeper;
use services::telegram::TelegramBot;
use state::AppState;

const DB_MAX_CONNECTIONS: u32 = 5;

fn fail(message: &str, err: &dyn std::fmt::Display) -> ! {
    error!(error = %err, "{}", message);
    std::process::exit(1);
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subscription_bot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => fail("invalid configuration", &e),
    };

    let pool = match db::init_pool(&config.database_url, DB_MAX_CONNECTIONS).await {
        Ok(pool) => pool,
        Err(e) => fail("failed to initialize SQLite pool", &e),
    };
    let gateway = match CryptoPayClient::new(
        &config.crypto_bot_token,
        &config.crypto_pay_api_url,
        &config.payment_asset,
        config.http_timeout,
    ) {
        Ok(gateway) => gateway,
        Err(e) => fail("failed to build Crypto Pay client", &e),
    };
    let telegram = match TelegramBot::new(&config.bot_token, config.group_id, config.http_timeout) {
        Ok(telegram) => Arc::new(telegram),
        Err(e) => fail("failed to build Telegram client", &e),
    };

    let group_id = telegram.group_chat_id();
    match telegram.is_group_admin().await {
        Ok(true) => info!(group_id, "bot is an administrator of the group"),
        Ok(false) => warn!(group_id, "bot is not an administrator of the group, removals will fail"),
        Err(e) => warn!(group_id, error = %e, "could not check group rights"),
    }

    let engine = Arc::new(SubscriptionEngine::new(
        Arc::new(SqliteRepository::new(pool)),
        Arc::new(gateway),
        Arc::new(TariffCatalog::standard()),
        Arc::new(SystemClock),
    ));
    let app_state = AppState::new(engine.clone(), telegram.clone(), config.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = ExpirySweeper::new(
        engine,
        telegram,
        config.locale,
        config.sweep_interval,
        config.sweep_grace,
    );
    let sweep_task = tokio::spawn(sweeper.run(shutdown_rx.clone()));
    let polling_task = tokio::spawn(handlers::bot::run_polling(app_state.clone(), shutdown_rx));

    let data = web::Data::new(app_state);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(NormalizePath::trim())
            .app_data(data.clone())
            .route("/", web::get().to(handlers::main))
            .route("/health", web::get().to(handlers::health_check))
            .route("/webhook/crypto-pay", web::post().to(handlers::webhook::crypto_pay_webhook))
    })
    .bind(("0.0.0.0", config.port))?
    .disable_signals()
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("shutting down");
        let _ = shutdown_tx.send(true);
        handle.stop(true).await;
    });

    info!(port = config.port, "subscription bot started");
    server.await?;

    let _ = sweep_task.await;
    let _ = polling_task.await;
    Ok(())
}
