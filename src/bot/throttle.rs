//! Ограничение частоты действий пользователя: не чаще одного раза за период
//! на пару (telegram_id, действие).

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const ACTION_SUBSCRIPTION: &str = "subscription";
pub const ACTION_LINK: &str = "link";
pub const ACTION_SEARCH: &str = "search";
pub const ACTION_TOGGLE: &str = "toggle";

/// Раз в столько проверок из таблицы лимитера удаляются неактивные ключи.
const PRUNE_EVERY: u64 = 1024;

pub struct Throttle {
    limiter: Option<DefaultKeyedRateLimiter<(i64, &'static str)>>,
    clock: DefaultClock,
    checks: AtomicU64,
}

impl Throttle {
    /// Нулевой период отключает ограничение.
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: Quota::with_period(period).map(RateLimiter::keyed),
            clock: DefaultClock::default(),
            checks: AtomicU64::new(0),
        }
    }

    /// `Err` содержит время до следующей разрешённой попытки.
    pub fn check(&self, telegram_id: i64, action: &'static str) -> Result<(), Duration> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune();
        }
        limiter
            .check_key(&(telegram_id, action))
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Удаляет ключи, период которых уже истёк.
    fn prune(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
            limiter.shrink_to_fit();
            tracing::debug!(tracked = limiter.len(), "Throttle table pruned");
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.len())
    }
}

pub fn wait_message(wait: Duration) -> String {
    format!(
        "⏳ Подождите {} сек. перед следующей командой",
        wait.as_secs().max(1)
    )
}
