//! Store-backed rate limiting. Counters live in the shared store so every
//! worker sees the same windows; nothing here is process-local.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{next_midnight_ms, Clock};
use crate::config::LimiterConfig;
use crate::error::{Result, TalonError};
use crate::store::{keys, LedgerStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowState {
    start_ms: i64,
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EarnQuota {
    day: NaiveDate,
    count: u32,
    cooldown_until_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EarnStatus {
    pub used_today: u32,
    pub daily_limit: u32,
    pub cooldown_until_ms: Option<i64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
}

impl RateLimiter {
    pub fn new(store: LedgerStore, clock: Arc<dyn Clock>, config: LimiterConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Admission gate for instance creation, keyed by caller address.
    /// Consumes a slot in the current fixed window or rejects with the time
    /// until the window rolls over.
    pub async fn check_create(&self, addr: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let window_ms = self.config.create_window_secs as i64 * 1000;
        let max = self.config.create_max;
        self.store
            .update::<WindowState, _>(&keys::create_limit(addr), |state| match state {
                Some(state) if now - state.start_ms < window_ms => {
                    if state.count >= max {
                        let retry = window_ms - (now - state.start_ms);
                        return Err(TalonError::RateLimited {
                            retry_after: Duration::from_millis(retry.max(0) as u64),
                        });
                    }
                    Ok(Some(WindowState {
                        start_ms: state.start_ms,
                        count: state.count + 1,
                    }))
                }
                _ => Ok(Some(WindowState {
                    start_ms: now,
                    count: 1,
                })),
            })
            .await?;
        Ok(())
    }

    /// Earn-ticket gate: a per-day cap plus a short cooldown between
    /// grants, both keyed by caller address. The day boundary is UTC
    /// midnight.
    pub async fn check_earn(&self, addr: &str) -> Result<()> {
        let now = self.clock.now_millis();
        let today = self.clock.today();
        let cooldown_ms = self.config.earn_cooldown_secs as i64 * 1000;
        let limit = self.config.earn_daily_limit;
        let midnight_ms = next_midnight_ms(today);
        self.store
            .update::<EarnQuota, _>(&keys::earn_quota(addr), |quota| {
                let quota = match quota {
                    Some(q) if q.day == today => q,
                    _ => EarnQuota {
                        day: today,
                        count: 0,
                        cooldown_until_ms: 0,
                    },
                };
                if quota.count >= limit {
                    return Err(TalonError::RateLimited {
                        retry_after: Duration::from_millis((midnight_ms - now).max(0) as u64),
                    });
                }
                if now < quota.cooldown_until_ms {
                    return Err(TalonError::RateLimited {
                        retry_after: Duration::from_millis((quota.cooldown_until_ms - now) as u64),
                    });
                }
                Ok(Some(EarnQuota {
                    day: today,
                    count: quota.count + 1,
                    cooldown_until_ms: now + cooldown_ms,
                }))
            })
            .await?;
        Ok(())
    }

    pub async fn earn_status(&self, addr: &str) -> Result<EarnStatus> {
        let now = self.clock.now_millis();
        let today = self.clock.today();
        let quota = self
            .store
            .get::<EarnQuota>(&keys::earn_quota(addr))
            .await?
            .filter(|q| q.day == today);
        let (used_today, cooldown_until_ms) = match quota {
            Some(q) => {
                let cooldown = (q.cooldown_until_ms > now).then_some(q.cooldown_until_ms);
                (q.count, cooldown)
            }
            None => (0, None),
        };
        Ok(EarnStatus {
            used_today,
            daily_limit: self.config.earn_daily_limit,
            cooldown_until_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use chrono::TimeZone;

    fn limiter(config: LimiterConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(LedgerStore::in_memory(), clock.clone(), config);
        (limiter, clock)
    }

    #[tokio::test]
    async fn test_create_window_admits_then_blocks() {
        let (limiter, clock) = limiter(LimiterConfig::default());

        // Default window: one request per 3 seconds
        limiter.check_create("203.0.113.5").await.unwrap();
        let err = limiter.check_create("203.0.113.5").await.unwrap_err();
        match err {
            TalonError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(3));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        // A different address has its own window
        limiter.check_create("203.0.113.6").await.unwrap();

        clock.advance(chrono::Duration::seconds(3));
        limiter.check_create("203.0.113.5").await.unwrap();
    }

    #[tokio::test]
    async fn test_earn_cooldown_between_grants() {
        let (limiter, clock) = limiter(LimiterConfig::default());

        limiter.check_earn("203.0.113.5").await.unwrap();
        let err = limiter.check_earn("203.0.113.5").await.unwrap_err();
        match err {
            TalonError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(10));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }

        clock.advance(chrono::Duration::seconds(10));
        limiter.check_earn("203.0.113.5").await.unwrap();
    }

    #[tokio::test]
    async fn test_earn_daily_cap_resets_at_midnight() {
        let config = LimiterConfig {
            earn_daily_limit: 2,
            ..LimiterConfig::default()
        };
        let (limiter, clock) = limiter(config);

        limiter.check_earn("10.0.0.9").await.unwrap();
        clock.advance(chrono::Duration::seconds(10));
        limiter.check_earn("10.0.0.9").await.unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let err = limiter.check_earn("10.0.0.9").await.unwrap_err();
        assert!(matches!(err, TalonError::RateLimited { .. }));

        let status = limiter.earn_status("10.0.0.9").await.unwrap();
        assert_eq!(status.used_today, 2);
        assert_eq!(status.daily_limit, 2);

        // Fresh day, fresh quota
        clock.advance(chrono::Duration::hours(12));
        limiter.check_earn("10.0.0.9").await.unwrap();
        assert_eq!(limiter.earn_status("10.0.0.9").await.unwrap().used_today, 1);
    }
}
