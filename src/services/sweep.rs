use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::i18n::{self, Locale};
use crate::services::subscription::{Messenger, SubscriptionEngine, SweepReport};

/// Periodic task that revokes expired subscriptions.
pub struct ExpirySweeper {
    engine: Arc<SubscriptionEngine>,
    messenger: Arc<dyn Messenger>,
    locale: Locale,
    interval: Duration,
    grace: Duration,
}

impl ExpirySweeper {
    pub fn new(
        engine: Arc<SubscriptionEngine>,
        messenger: Arc<dyn Messenger>,
        locale: Locale,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self { engine, messenger, locale, interval, grace }
    }

    pub async fn sweep_once(&self) -> Option<SweepReport> {
        let notice = i18n::subscription_expired_notice(self.locale);
        match self.engine.sweep_expired(self.messenger.as_ref(), notice, self.grace).await {
            Ok(report) => {
                if !report.removed.is_empty() || !report.failed.is_empty() {
                    info!(removed = report.removed.len(), failed = report.failed.len(), "expiry sweep finished");
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "expiry sweep failed to load expired users");
                None
            }
        }
    }

    /// Sweeps on every tick, the first one immediately, until `shutdown` flips
    /// to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "expiry sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("expiry sweeper stopped");
    }
}
