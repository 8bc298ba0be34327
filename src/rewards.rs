//! Free coin flows: the once-a-day login bonus, short-lived earn tokens
//! handed out behind the earn rate limit, and AFK-page accrual.

use chrono::NaiveDate;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{next_midnight_ms, Clock};
use crate::config::RewardsConfig;
use crate::error::{Result, TalonError};
use crate::ledger::coins::CoinLedger;
use crate::limiter::RateLimiter;
use crate::store::{keys, LedgerStore};

const EARN_TOKEN_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct DailyStatus {
    pub claimable: bool,
    /// Until the next UTC midnight; only set while today's bonus is spent.
    pub reset_in: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AfkSession {
    last_award_ms: i64,
}

pub struct RewardsDesk {
    store: LedgerStore,
    coins: CoinLedger,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    config: RewardsConfig,
}

impl RewardsDesk {
    pub fn new(
        store: LedgerStore,
        coins: CoinLedger,
        limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        config: RewardsConfig,
    ) -> Self {
        Self {
            store,
            coins,
            limiter,
            clock,
            config,
        }
    }

    /// Once per UTC calendar day. The date is swapped in under a
    /// conditional write before the credit, so two racing claims on the
    /// same day pay out once.
    pub async fn claim_daily(&self, account: &str) -> Result<Decimal> {
        let today = self.clock.today();
        let now = self.clock.now_millis();
        self.store
            .update::<NaiveDate, _>(&keys::daily_claim(account), |last| {
                if last == Some(today) {
                    let remaining = (next_midnight_ms(today) - now).max(0);
                    return Err(TalonError::CooldownActive {
                        remaining: Duration::from_millis(remaining as u64),
                    });
                }
                Ok(Some(today))
            })
            .await?;
        self.coins.credit(account, self.config.daily_coins).await
    }

    pub async fn daily_status(&self, account: &str) -> Result<DailyStatus> {
        let today = self.clock.today();
        let last = self
            .store
            .get::<NaiveDate>(&keys::daily_claim(account))
            .await?;
        if last == Some(today) {
            let remaining = (next_midnight_ms(today) - self.clock.now_millis()).max(0);
            Ok(DailyStatus {
                claimable: false,
                reset_in: Some(Duration::from_millis(remaining as u64)),
            })
        } else {
            Ok(DailyStatus {
                claimable: true,
                reset_in: None,
            })
        }
    }

    /// Hand out a one-shot earn code, gated by the per-address earn limit.
    /// A fresh token replaces any outstanding one for the account.
    pub async fn issue_earn_token(&self, account: &str, addr: &str) -> Result<String> {
        self.limiter.check_earn(addr).await?;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(EARN_TOKEN_LEN)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        self.store.set(&keys::earn_token(account), &token).await?;
        Ok(token)
    }

    /// Pay out an earn token. The token is deleted under a conditional
    /// write, so presenting the same code twice credits once.
    pub async fn redeem_earn_token(&self, account: &str, code: &str) -> Result<Decimal> {
        let Some(stored) = self.store.get::<String>(&keys::earn_token(account)).await? else {
            return Err(TalonError::Validation(
                "no earn token outstanding".to_string(),
            ));
        };
        if stored != code.trim() {
            return Err(TalonError::Validation(
                "earn token does not match".to_string(),
            ));
        }
        let claimed = self
            .store
            .compare_and_swap(&keys::earn_token(account), Some(&stored), None::<&String>)
            .await?;
        if !claimed {
            return Err(TalonError::Validation(
                "earn token was already redeemed".to_string(),
            ));
        }
        self.coins.credit(account, self.config.earn_coins).await
    }

    /// AFK accrual tick. Pays for each whole interval elapsed since the
    /// last award; the first tick of a session only starts the meter.
    /// Returns the amount credited, zero when no interval completed yet.
    pub async fn award_afk_tick(&self, account: &str) -> Result<Decimal> {
        let now = self.clock.now_millis();
        let interval_ms = (self.config.afk_interval_secs.max(1) as i64) * 1000;
        let mut intervals: i64 = 0;
        self.store
            .update::<AfkSession, _>(&keys::afk_session(account), |session| match session {
                None => {
                    intervals = 0;
                    Ok(Some(AfkSession { last_award_ms: now }))
                }
                Some(session) => {
                    intervals = ((now - session.last_award_ms) / interval_ms).max(0);
                    if intervals == 0 {
                        return Ok(Some(session));
                    }
                    Ok(Some(AfkSession {
                        last_award_ms: session.last_award_ms + intervals * interval_ms,
                    }))
                }
            })
            .await?;
        if intervals == 0 {
            return Ok(Decimal::ZERO);
        }

        let per_interval = self.config.afk_coins_per_minute
            * Decimal::from(self.config.afk_interval_secs)
            / Decimal::from(60);
        let payout = per_interval * Decimal::from(intervals);
        self.coins.credit(account, payout).await?;
        Ok(payout)
    }

    /// Forget the AFK meter, e.g. when the account's AFK page closes.
    pub async fn end_afk_session(&self, account: &str) -> Result<()> {
        self.store.delete(&keys::afk_session(account)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::config::LimiterConfig;
    use crate::notifier::NullNotifier;
    use chrono::TimeZone;

    fn desk() -> (RewardsDesk, CoinLedger, Arc<ManualClock>) {
        let store = LedgerStore::in_memory();
        let clock = Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap(),
        ));
        let coins = CoinLedger::new(store.clone(), clock.clone(), Arc::new(NullNotifier), 900);
        let limiter = RateLimiter::new(store.clone(), clock.clone(), LimiterConfig::default());
        let desk = RewardsDesk::new(
            store,
            coins.clone(),
            limiter,
            clock.clone(),
            RewardsConfig::default(),
        );
        (desk, coins, clock)
    }

    #[tokio::test]
    async fn test_daily_claim_once_per_day() {
        let (desk, coins, clock) = desk();

        desk.claim_daily("alice").await.unwrap();
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(150));

        let err = desk.claim_daily("alice").await.unwrap_err();
        match err {
            TalonError::CooldownActive { remaining } => {
                // Claimed at 18:00, so six hours until midnight
                assert_eq!(remaining, Duration::from_secs(6 * 3600));
            }
            other => panic!("expected CooldownActive, got {:?}", other),
        }
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(150));

        let status = desk.daily_status("alice").await.unwrap();
        assert!(!status.claimable);
        assert_eq!(status.reset_in, Some(Duration::from_secs(6 * 3600)));

        // Next day it is claimable again
        clock.advance(chrono::Duration::hours(6));
        assert!(desk.daily_status("alice").await.unwrap().claimable);
        desk.claim_daily("alice").await.unwrap();
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(300));
    }

    #[tokio::test]
    async fn test_earn_token_single_use() {
        let (desk, coins, _) = desk();

        let token = desk.issue_earn_token("alice", "203.0.113.5").await.unwrap();
        assert_eq!(token.len(), EARN_TOKEN_LEN);

        assert!(desk
            .redeem_earn_token("alice", "wrong-token")
            .await
            .is_err());

        desk.redeem_earn_token("alice", &token).await.unwrap();
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(10));

        // Spent tokens are gone
        let err = desk.redeem_earn_token("alice", &token).await.unwrap_err();
        assert!(matches!(err, TalonError::Validation(_)));
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(10));
    }

    #[tokio::test]
    async fn test_earn_issue_respects_limiter() {
        let (desk, _, clock) = desk();

        desk.issue_earn_token("alice", "203.0.113.5").await.unwrap();
        // Ten-second cooldown between grants per address
        let err = desk
            .issue_earn_token("alice", "203.0.113.5")
            .await
            .unwrap_err();
        assert!(matches!(err, TalonError::RateLimited { .. }));

        clock.advance(chrono::Duration::seconds(10));
        desk.issue_earn_token("alice", "203.0.113.5").await.unwrap();
    }

    #[tokio::test]
    async fn test_afk_accrual_per_interval() {
        let (desk, coins, clock) = desk();

        // First tick arms the meter, pays nothing
        assert_eq!(desk.award_afk_tick("alice").await.unwrap(), Decimal::ZERO);

        // Default rate: 1.5 coins per 60s interval
        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(
            desk.award_afk_tick("alice").await.unwrap(),
            Decimal::new(15, 1)
        );

        // A late tick catches up on every whole interval missed
        clock.advance(chrono::Duration::seconds(185));
        assert_eq!(
            desk.award_afk_tick("alice").await.unwrap(),
            Decimal::new(45, 1)
        );
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(6));

        // 5 leftover seconds do not pay until the interval completes
        clock.advance(chrono::Duration::seconds(55));
        assert_eq!(
            desk.award_afk_tick("alice").await.unwrap(),
            Decimal::new(15, 1)
        );

        desk.end_afk_session("alice").await.unwrap();
        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(desk.award_afk_tick("alice").await.unwrap(), Decimal::ZERO);
    }
}
