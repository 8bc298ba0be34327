//! Referral codes: an account publishes a code, another account claims it
//! once, both sides get coins.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::config::ReferralConfig;
use crate::error::{Result, TalonError};
use crate::ledger::coins::CoinLedger;
use crate::store::{keys, LedgerStore};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferralCode {
    pub owner: String,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ClaimPayout {
    pub owner_bonus: Decimal,
    pub claimer_bonus: Decimal,
}

pub struct ReferralDesk {
    store: LedgerStore,
    coins: CoinLedger,
    clock: Arc<dyn Clock>,
    config: ReferralConfig,
}

impl ReferralDesk {
    pub fn new(
        store: LedgerStore,
        coins: CoinLedger,
        clock: Arc<dyn Clock>,
        config: ReferralConfig,
    ) -> Self {
        Self {
            store,
            coins,
            clock,
            config,
        }
    }

    /// Publish a code owned by `account`. Codes are first come first
    /// served; the conditional write keeps two accounts from registering
    /// the same one.
    pub async fn register_code(&self, account: &str, code: &str) -> Result<ReferralCode> {
        let code = normalize(code, self.config.code_max_len)?;
        let record = ReferralCode {
            owner: account.to_string(),
            created_ms: self.clock.now_millis(),
        };
        let claimed = self
            .store
            .compare_and_swap(&keys::referral_code(&code), None::<&ReferralCode>, Some(&record))
            .await?;
        if !claimed {
            return Err(TalonError::Validation(format!(
                "referral code `{}` is taken",
                code
            )));
        }
        info!("referral code `{}` registered by {}", code, account);
        Ok(record)
    }

    pub async fn get(&self, code: &str) -> Result<Option<ReferralCode>> {
        let code = normalize(code, self.config.code_max_len)?;
        self.store.get::<ReferralCode>(&keys::referral_code(&code)).await
    }

    /// The code this account claimed, if it ever claimed one.
    pub async fn claimed_by(&self, account: &str) -> Result<Option<String>> {
        self.store
            .get::<String>(&keys::referral_claimed(account))
            .await
    }

    /// Claim someone else's code. One claim per account, ever; the claimed
    /// marker is won with a conditional write before anything pays out.
    pub async fn claim(&self, account: &str, code: &str) -> Result<ClaimPayout> {
        let code = normalize(code, self.config.code_max_len)?;
        let Some(record) = self
            .store
            .get::<ReferralCode>(&keys::referral_code(&code))
            .await?
        else {
            return Err(TalonError::InvalidCode);
        };
        if record.owner == account {
            return Err(TalonError::Validation(
                "cannot claim your own referral code".to_string(),
            ));
        }

        let marked = self
            .store
            .compare_and_swap(
                &keys::referral_claimed(account),
                None::<&String>,
                Some(&code),
            )
            .await?;
        if !marked {
            return Err(TalonError::Validation(
                "a referral code was already claimed by this account".to_string(),
            ));
        }

        self.coins
            .credit(&record.owner, self.config.owner_bonus)
            .await?;
        self.coins
            .credit(account, self.config.claimer_bonus)
            .await?;
        info!(
            "referral `{}` claimed by {}, owner {}",
            code, account, record.owner
        );
        Ok(ClaimPayout {
            owner_bonus: self.config.owner_bonus,
            claimer_bonus: self.config.claimer_bonus,
        })
    }
}

fn normalize(code: &str, max_len: usize) -> Result<String> {
    let code = code.trim().to_lowercase();
    if code.is_empty() || code.len() > max_len {
        return Err(TalonError::Validation(format!(
            "referral code must be 1..={} characters",
            max_len
        )));
    }
    if code.chars().any(char::is_whitespace) {
        return Err(TalonError::Validation(
            "referral code cannot contain whitespace".to_string(),
        ));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::notifier::NullNotifier;
    use chrono::TimeZone;

    fn desk() -> (ReferralDesk, CoinLedger) {
        let store = LedgerStore::in_memory();
        let clock = Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let coins = CoinLedger::new(store.clone(), clock.clone(), Arc::new(NullNotifier), 900);
        let desk = ReferralDesk::new(store, coins.clone(), clock, ReferralConfig::default());
        (desk, coins)
    }

    #[tokio::test]
    async fn test_claim_pays_both_sides_once() {
        let (desk, coins) = desk();
        desk.register_code("owner-acc", "friendly").await.unwrap();

        let payout = desk.claim("new-acc", "FRIENDLY").await.unwrap();
        assert_eq!(payout.owner_bonus, Decimal::from(80));
        assert_eq!(payout.claimer_bonus, Decimal::from(250));
        assert_eq!(coins.balance("owner-acc").await.unwrap(), Decimal::from(80));
        assert_eq!(coins.balance("new-acc").await.unwrap(), Decimal::from(250));
        assert_eq!(
            desk.claimed_by("new-acc").await.unwrap(),
            Some("friendly".to_string())
        );

        // One referral per account, even for a different code
        desk.register_code("other-acc", "another").await.unwrap();
        let err = desk.claim("new-acc", "another").await.unwrap_err();
        assert!(matches!(err, TalonError::Validation(_)));
        assert_eq!(coins.balance("new-acc").await.unwrap(), Decimal::from(250));
    }

    #[tokio::test]
    async fn test_register_rejects_taken_and_malformed() {
        let (desk, _) = desk();
        desk.register_code("a", "mycode").await.unwrap();

        // Case-insensitive collision
        assert!(desk.register_code("b", "MYCODE").await.is_err());
        assert!(desk.register_code("b", "").await.is_err());
        assert!(desk.register_code("b", "way-too-long-for-a-code").await.is_err());
        assert!(desk.register_code("b", "has space").await.is_err());
    }

    #[tokio::test]
    async fn test_own_and_unknown_codes_rejected() {
        let (desk, coins) = desk();
        desk.register_code("a", "selfie").await.unwrap();

        assert!(matches!(
            desk.claim("a", "selfie").await.unwrap_err(),
            TalonError::Validation(_)
        ));
        assert!(matches!(
            desk.claim("b", "ghost").await.unwrap_err(),
            TalonError::InvalidCode
        ));
        assert_eq!(coins.balance("a").await.unwrap(), Decimal::ZERO);
    }
}
