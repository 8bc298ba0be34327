//! Staking with simple interest. Principal lives under its own key and the
//! accrual anchor under another; earnings are `principal * daily_rate *
//! elapsed / 24h`, never compounded.
//!
//! Semantics worth knowing before touching anything here:
//! - `stake` resets the anchor, discarding unclaimed accrual, unless
//!   `settle_before_stake` credits it first.
//! - `unstake` pays interest over the full pre-unstake principal and leaves
//!   the anchor alone unless `reset_anchor_on_unstake` is set.
//! - `claim` always resets the anchor.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::StakingConfig;
use crate::error::{Result, TalonError};
use crate::ledger::coins::CoinLedger;
use crate::ledger::require_positive;
use crate::store::{keys, LedgerStore};

const ANCHOR_RETRIES: usize = 8;

#[derive(Debug, Clone, Serialize)]
pub struct StakePosition {
    pub principal: Decimal,
    pub anchor_ms: Option<i64>,
    /// Earnings accrued since the anchor, as of now. Preview only.
    pub accrued: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnstakeOutcome {
    pub returned: Decimal,
    pub earnings: Decimal,
    pub remaining: Decimal,
}

#[derive(Clone)]
pub struct StakingEngine {
    store: LedgerStore,
    coins: CoinLedger,
    clock: Arc<dyn Clock>,
    config: StakingConfig,
}

impl StakingEngine {
    pub fn new(
        store: LedgerStore,
        coins: CoinLedger,
        clock: Arc<dyn Clock>,
        config: StakingConfig,
    ) -> Self {
        Self {
            store,
            coins,
            clock,
            config,
        }
    }

    pub async fn position(&self, account: &str) -> Result<StakePosition> {
        let principal = self.staked(account).await?;
        let anchor_ms = self.anchor(account).await?;
        let accrued = match anchor_ms {
            Some(anchor) => earnings_for(
                principal,
                anchor,
                self.clock.now_millis(),
                self.config.daily_rate,
            ),
            None => Decimal::ZERO,
        };
        Ok(StakePosition {
            principal,
            anchor_ms,
            accrued,
        })
    }

    /// Move coins from the balance into the staked principal and restart
    /// accrual from now.
    pub async fn stake(&self, account: &str, amount: Decimal) -> Result<StakePosition> {
        if amount < self.config.min_stake {
            return Err(TalonError::Validation(format!(
                "minimum stake is {} coins",
                self.config.min_stake
            )));
        }

        if self.config.settle_before_stake {
            // Best effort: pay out what accrued so the anchor reset below
            // does not discard it.
            match self.claim(account).await {
                Ok(_) | Err(TalonError::NothingToClaim) => {}
                Err(e) => return Err(e),
            }
        }

        self.coins.debit(account, amount).await?;
        self.store
            .update::<Decimal, _>(&keys::staked(account), |current| {
                Ok(Some(current.unwrap_or(Decimal::ZERO) + amount))
            })
            .await?;
        self.store
            .set(&keys::stake_anchor(account), &self.clock.now_millis())
            .await?;
        self.position(account).await
    }

    /// Return part of the principal to the balance together with interest
    /// accrued over the full pre-unstake principal. Gated by the cooldown
    /// measured from the anchor.
    pub async fn unstake(&self, account: &str, amount: Decimal) -> Result<UnstakeOutcome> {
        require_positive(amount)?;
        let now = self.clock.now_millis();
        let anchor_ms = self.anchor(account).await?;

        let cooldown_ms = self.config.unstake_cooldown_secs as i64 * 1000;
        let rate = self.config.daily_rate;
        let mut earnings = Decimal::ZERO;
        let mut remaining = Decimal::ZERO;
        self.store
            .update::<Decimal, _>(&keys::staked(account), |current| {
                let staked = current.unwrap_or(Decimal::ZERO);
                // Principal first: an over-sized request reports the
                // shortfall even while the cooldown is still running.
                if staked < amount {
                    return Err(TalonError::InsufficientStake {
                        staked,
                        requested: amount,
                    });
                }
                if let Some(anchor) = anchor_ms {
                    let elapsed = now - anchor;
                    if elapsed < cooldown_ms {
                        return Err(TalonError::CooldownActive {
                            remaining: Duration::from_millis((cooldown_ms - elapsed) as u64),
                        });
                    }
                }
                earnings = match anchor_ms {
                    Some(anchor) => earnings_for(staked, anchor, now, rate),
                    None => Decimal::ZERO,
                };
                remaining = staked - amount;
                if remaining.is_zero() {
                    Ok(None)
                } else {
                    Ok(Some(remaining))
                }
            })
            .await?;

        if remaining.is_zero() {
            self.store.delete(&keys::stake_anchor(account)).await?;
        } else if self.config.reset_anchor_on_unstake {
            self.store.set(&keys::stake_anchor(account), &now).await?;
        }

        self.coins.credit(account, amount + earnings).await?;
        Ok(UnstakeOutcome {
            returned: amount,
            earnings,
            remaining,
        })
    }

    /// Credit accrued earnings and restart accrual from now. The anchor
    /// swap is conditional, so two racing claims cannot both collect the
    /// same interval.
    pub async fn claim(&self, account: &str) -> Result<Decimal> {
        for _ in 0..ANCHOR_RETRIES {
            let principal = self.staked(account).await?;
            if principal <= Decimal::ZERO {
                return Err(TalonError::NothingToClaim);
            }
            let Some(anchor) = self.anchor(account).await? else {
                return Err(TalonError::NothingToClaim);
            };
            let now = self.clock.now_millis();
            let earnings = earnings_for(principal, anchor, now, self.config.daily_rate);
            if earnings <= Decimal::ZERO {
                return Err(TalonError::NothingToClaim);
            }
            let swapped = self
                .store
                .compare_and_swap(&keys::stake_anchor(account), Some(&anchor), Some(&now))
                .await?;
            if swapped {
                self.coins.credit(account, earnings).await?;
                return Ok(earnings);
            }
        }
        Err(TalonError::Store(
            "contention on stake anchor exceeded retries".to_string(),
        ))
    }

    async fn staked(&self, account: &str) -> Result<Decimal> {
        Ok(self
            .store
            .get::<Decimal>(&keys::staked(account))
            .await?
            .unwrap_or(Decimal::ZERO))
    }

    async fn anchor(&self, account: &str) -> Result<Option<i64>> {
        self.store.get::<i64>(&keys::stake_anchor(account)).await
    }
}

fn earnings_for(principal: Decimal, anchor_ms: i64, now_ms: i64, daily_rate: Decimal) -> Decimal {
    if now_ms <= anchor_ms || principal <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let elapsed = Decimal::from(now_ms - anchor_ms);
    principal * daily_rate * elapsed / Decimal::from(86_400_000i64)
}
