//! One-time coupon codes redeemable for coins and resource grants.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, TalonError};
use crate::ledger::coins::CoinLedger;
use crate::ledger::resources::{ResourceKind, ResourceLedger};
use crate::notifier::{AlertEvent, Notifier};
use crate::store::{keys, LedgerStore};

/// What a single redemption pays out. Any subset of the fields may be zero
/// as long as at least one is not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coupon {
    pub coins: Decimal,
    pub ram: u64,
    pub disk: u64,
    pub cpu: u64,
    pub servers: u64,
}

impl Coupon {
    fn grants_nothing(&self) -> bool {
        self.coins <= Decimal::ZERO
            && self.ram == 0
            && self.disk == 0
            && self.cpu == 0
            && self.servers == 0
    }
}

/// Codes are case-insensitive and restricted to lowercase alphanumerics
/// after normalization.
fn normalize(code: &str) -> Result<String> {
    let code = code.trim().to_lowercase();
    if code.is_empty()
        || !code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(TalonError::InvalidCode);
    }
    Ok(code)
}

#[derive(Clone)]
pub struct CouponBook {
    store: LedgerStore,
    coins: CoinLedger,
    resources: ResourceLedger,
    notifier: Arc<dyn Notifier>,
}

impl CouponBook {
    pub fn new(
        store: LedgerStore,
        coins: CoinLedger,
        resources: ResourceLedger,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            coins,
            resources,
            notifier,
        }
    }

    /// Admin: publish a coupon. Fails on duplicate codes so an existing
    /// coupon's rewards cannot be silently replaced.
    pub async fn create(&self, code: &str, coupon: Coupon) -> Result<String> {
        let code = normalize(code)?;
        if coupon.coins < Decimal::ZERO {
            return Err(TalonError::Validation(
                "coupon coins cannot be negative".to_string(),
            ));
        }
        if coupon.grants_nothing() {
            return Err(TalonError::Validation(
                "coupon must grant coins or resources".to_string(),
            ));
        }
        let created = self
            .store
            .compare_and_swap(&keys::coupon(&code), None::<&Coupon>, Some(&coupon))
            .await?;
        if !created {
            return Err(TalonError::Validation(format!(
                "coupon `{}` already exists",
                code
            )));
        }
        self.notifier
            .notify(AlertEvent::CouponCreated { code: code.clone() })
            .await;
        Ok(code)
    }

    /// Admin: withdraw a coupon from circulation. Redemption history stays.
    pub async fn revoke(&self, code: &str) -> Result<()> {
        let code = normalize(code)?;
        if self.store.get::<Coupon>(&keys::coupon(&code)).await?.is_none() {
            return Err(TalonError::NotFound(format!("coupon `{}`", code)));
        }
        self.store.delete(&keys::coupon(&code)).await?;
        self.notifier
            .notify(AlertEvent::CouponRevoked { code })
            .await;
        Ok(())
    }

    pub async fn get(&self, code: &str) -> Result<Option<Coupon>> {
        let code = normalize(code)?;
        self.store.get::<Coupon>(&keys::coupon(&code)).await
    }

    /// Codes an account has already used.
    pub async fn redeemed_by(&self, account: &str) -> Result<Vec<String>> {
        Ok(self
            .store
            .get::<Vec<String>>(&keys::used_coupons(account))
            .await?
            .unwrap_or_default())
    }

    /// Redeem a code for the calling account. The per-account used-list is
    /// appended under a conditional write before anything pays out, so two
    /// racing redemptions of the same code cannot both collect.
    pub async fn redeem(&self, account: &str, code: &str) -> Result<Coupon> {
        let code = normalize(code)?;
        let Some(coupon) = self.store.get::<Coupon>(&keys::coupon(&code)).await? else {
            return Err(TalonError::InvalidCode);
        };

        self.store
            .update::<Vec<String>, _>(&keys::used_coupons(account), |used| {
                let mut used = used.unwrap_or_default();
                if used.iter().any(|c| c == &code) {
                    return Err(TalonError::AlreadyRedeemed(code.clone()));
                }
                used.push(code.clone());
                Ok(Some(used))
            })
            .await?;

        if coupon.coins > Decimal::ZERO {
            self.coins.credit(account, coupon.coins).await?;
        }
        for kind in ResourceKind::ALL {
            let amount = match kind {
                ResourceKind::Ram => coupon.ram,
                ResourceKind::Disk => coupon.disk,
                ResourceKind::Cpu => coupon.cpu,
                ResourceKind::Servers => coupon.servers,
            };
            if amount > 0 {
                self.resources.grant(account, kind, amount).await?;
            }
        }

        self.notifier
            .notify(AlertEvent::CouponRedeemed {
                account: account.to_string(),
                code: code.clone(),
            })
            .await;
        Ok(coupon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::config::{PlanConfig, ShopConfig};
    use crate::notifier::NullNotifier;
    use chrono::TimeZone;

    fn book() -> (CouponBook, CoinLedger, ResourceLedger) {
        let store = LedgerStore::in_memory();
        let clock = Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let coins = CoinLedger::new(store.clone(), clock, Arc::new(NullNotifier), 900);
        let resources = ResourceLedger::new(
            store.clone(),
            coins.clone(),
            ShopConfig::default(),
            PlanConfig::default(),
        );
        let book = CouponBook::new(store, coins.clone(), resources.clone(), Arc::new(NullNotifier));
        (book, coins, resources)
    }

    fn coin_coupon(amount: i64) -> Coupon {
        Coupon {
            coins: Decimal::from(amount),
            ram: 0,
            disk: 0,
            cpu: 0,
            servers: 0,
        }
    }

    #[tokio::test]
    async fn test_redeem_pays_once_per_account() {
        let (book, coins, _) = book();
        book.create("save10", coin_coupon(100)).await.unwrap();

        // Uppercase input normalizes onto the same code
        book.redeem("alice", "SAVE10").await.unwrap();
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(100));

        let err = book.redeem("alice", "save10").await.unwrap_err();
        assert!(matches!(err, TalonError::AlreadyRedeemed(_)));
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(100));

        // A different account still redeems fine
        book.redeem("bob", "save10").await.unwrap();
        assert_eq!(coins.balance("bob").await.unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_codes() {
        let (book, _, _) = book();
        assert!(matches!(
            book.redeem("alice", "nope").await.unwrap_err(),
            TalonError::InvalidCode
        ));
        assert!(matches!(
            book.redeem("alice", "bad code!").await.unwrap_err(),
            TalonError::InvalidCode
        ));
        assert!(matches!(
            book.redeem("alice", "  ").await.unwrap_err(),
            TalonError::InvalidCode
        ));
    }

    #[tokio::test]
    async fn test_resource_coupon_grants() {
        let (book, coins, resources) = book();
        book.create(
            "bundle",
            Coupon {
                coins: Decimal::from(50),
                ram: 512,
                disk: 0,
                cpu: 0,
                servers: 1,
            },
        )
        .await
        .unwrap();

        book.redeem("alice", "bundle").await.unwrap();
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::from(50));
        let grants = resources.grants("alice").await.unwrap();
        assert_eq!(grants.ram, 512);
        assert_eq!(grants.servers, 1);
        assert_eq!(grants.disk, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_empty_rewards() {
        let (book, _, _) = book();
        book.create("promo", coin_coupon(10)).await.unwrap();
        assert!(book.create("promo", coin_coupon(20)).await.is_err());
        assert!(book.create("empty", coin_coupon(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_revoked_coupon_no_longer_redeems() {
        let (book, coins, _) = book();
        book.create("gone", coin_coupon(10)).await.unwrap();
        book.revoke("gone").await.unwrap();

        let err = book.redeem("alice", "gone").await.unwrap_err();
        assert!(matches!(err, TalonError::InvalidCode));
        assert_eq!(coins.balance("alice").await.unwrap(), Decimal::ZERO);

        // Revoking twice reports the absence
        assert!(matches!(
            book.revoke("gone").await.unwrap_err(),
            TalonError::NotFound(_)
        ));
    }
}
