use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::DailyStats;

/// Daily statistics per (owner, date). A new date starts a fresh record, so
/// the day boundary needs no explicit reset.
pub struct DailyStatsBook {
    days: RwLock<BTreeMap<(String, NaiveDate), DailyStats>>,
    retention_days: i64,
}

impl DailyStatsBook {
    pub fn new(retention_days: i64) -> Self {
        Self {
            days: RwLock::new(BTreeMap::new()),
            retention_days,
        }
    }

    /// Apply `f` to the record for (owner, date), creating it if needed, and
    /// return a copy of the result.
    pub async fn update<F>(&self, owner: &str, date: NaiveDate, f: F) -> DailyStats
    where
        F: FnOnce(&mut DailyStats),
    {
        let mut days = self.days.write().await;
        let stats = days
            .entry((owner.to_string(), date))
            .or_insert_with(|| DailyStats::new(owner, date));
        f(stats);
        stats.revision += 1;
        stats.clone()
    }

    pub async fn get(&self, owner: &str, date: NaiveDate) -> Option<DailyStats> {
        self.days.read().await.get(&(owner.to_string(), date)).cloned()
    }

    /// Records with `from <= date <= to`, oldest first
    pub async fn range(&self, owner: &str, from: NaiveDate, to: NaiveDate) -> Vec<DailyStats> {
        if from > to {
            return Vec::new();
        }
        self.days
            .read()
            .await
            .range((owner.to_string(), from)..=(owner.to_string(), to))
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Every owner's record for one date
    pub async fn for_date(&self, date: NaiveDate) -> Vec<DailyStats> {
        self.days
            .read()
            .await
            .values()
            .filter(|s| s.date == date)
            .cloned()
            .collect()
    }

    /// Net realized P&L for the owner today, zero if nothing closed yet
    pub async fn today_net_pnl(&self, owner: &str) -> Decimal {
        self.get(owner, Utc::now().date_naive())
            .await
            .map(|s| s.net_pnl())
            .unwrap_or(Decimal::ZERO)
    }

    /// Drop records older than the retention window. Returns how many went.
    pub async fn rollover(&self, today: NaiveDate) -> usize {
        let cutoff = today - Duration::days(self.retention_days);
        let mut days = self.days.write().await;
        let before = days.len();
        days.retain(|(_, date), _| *date >= cutoff);
        before - days.len()
    }

    pub async fn len(&self) -> usize {
        self.days.read().await.len()
    }

    pub fn spawn_rollover(
        self: std::sync::Arc<Self>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut current = Utc::now().date_naive();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let today = Utc::now().date_naive();
                        if today != current {
                            for stats in self.for_date(current).await {
                                info!(
                                    owner = %stats.owner,
                                    date = %stats.date,
                                    trades = stats.trade_count,
                                    net_pnl = %stats.net_pnl(),
                                    win_rate = %stats.win_rate().round_dp(2),
                                    "Daily stats closed"
                                );
                            }
                            current = today;
                        }
                        let pruned = self.rollover(today).await;
                        if pruned > 0 {
                            debug!(pruned, "Expired daily stats removed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Daily stats rollover stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
