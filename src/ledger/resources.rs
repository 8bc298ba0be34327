//! Resource grants and plan entitlements. Grants are what an account
//! bought or was given on top of its plan; the entitlement is plan plus
//! grants and is what admission control compares usage against.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::coins::CoinLedger;
use crate::config::{PlanConfig, ShopConfig};
use crate::error::{Result, TalonError};
use crate::store::{keys, LedgerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Ram,
    Disk,
    Cpu,
    Servers,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Ram,
        ResourceKind::Disk,
        ResourceKind::Cpu,
        ResourceKind::Servers,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Ram => "ram",
            ResourceKind::Disk => "disk",
            ResourceKind::Cpu => "cpu",
            ResourceKind::Servers => "servers",
        };
        write!(f, "{}", name)
    }
}

/// Bundle of the four resource dimensions. Ram and disk are megabytes,
/// cpu is a percentage, servers a count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub ram: u64,
    pub disk: u64,
    pub cpu: u64,
    pub servers: u64,
}

impl ResourceSet {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Ram => self.ram,
            ResourceKind::Disk => self.disk,
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Servers => self.servers,
        }
    }

    pub fn add(&mut self, kind: ResourceKind, amount: u64) {
        let slot = match kind {
            ResourceKind::Ram => &mut self.ram,
            ResourceKind::Disk => &mut self.disk,
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Servers => &mut self.servers,
        };
        *slot = slot.saturating_add(amount);
    }

    pub fn plus(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            ram: self.ram.saturating_add(other.ram),
            disk: self.disk.saturating_add(other.disk),
            cpu: self.cpu.saturating_add(other.cpu),
            servers: self.servers.saturating_add(other.servers),
        }
    }

    /// True when every dimension of `other` fits within `self`.
    pub fn covers(&self, other: &ResourceSet) -> bool {
        self.ram >= other.ram
            && self.disk >= other.disk
            && self.cpu >= other.cpu
            && self.servers >= other.servers
    }
}

#[derive(Clone)]
pub struct ResourceLedger {
    store: LedgerStore,
    coins: CoinLedger,
    shop: ShopConfig,
    plans: PlanConfig,
}

impl ResourceLedger {
    pub fn new(store: LedgerStore, coins: CoinLedger, shop: ShopConfig, plans: PlanConfig) -> Self {
        Self {
            store,
            coins,
            shop,
            plans,
        }
    }

    /// Purchased and gifted grants, zero for untouched accounts.
    pub async fn grants(&self, account: &str) -> Result<ResourceSet> {
        Ok(self
            .store
            .get::<ResourceSet>(&keys::resources(account))
            .await?
            .unwrap_or_default())
    }

    /// Add units without charging. Coupons and admin tooling come through
    /// here.
    pub async fn grant(&self, account: &str, kind: ResourceKind, amount: u64) -> Result<ResourceSet> {
        if amount == 0 {
            return Err(TalonError::Validation(
                "grant amount must be positive".to_string(),
            ));
        }
        let written = self
            .store
            .update::<ResourceSet, _>(&keys::resources(account), |grants| {
                let mut grants = grants.unwrap_or_default();
                grants.add(kind, amount);
                Ok(Some(grants))
            })
            .await?;
        Ok(written.unwrap_or_default())
    }

    /// Admin removal. Rejects taking more than the account holds.
    pub async fn revoke(&self, account: &str, kind: ResourceKind, amount: u64) -> Result<ResourceSet> {
        if amount == 0 {
            return Err(TalonError::Validation(
                "revoke amount must be positive".to_string(),
            ));
        }
        let written = self
            .store
            .update::<ResourceSet, _>(&keys::resources(account), |grants| {
                let mut grants = grants.unwrap_or_default();
                let held = grants.get(kind);
                let remaining = held.checked_sub(amount).ok_or_else(|| {
                    TalonError::Validation(format!(
                        "account holds {} {} but {} requested",
                        held, kind, amount
                    ))
                })?;
                match kind {
                    ResourceKind::Ram => grants.ram = remaining,
                    ResourceKind::Disk => grants.disk = remaining,
                    ResourceKind::Cpu => grants.cpu = remaining,
                    ResourceKind::Servers => grants.servers = remaining,
                }
                Ok(Some(grants))
            })
            .await?;
        Ok(written.unwrap_or_default())
    }

    /// Buy `amount` shop units of a resource. Each unit costs
    /// `pricing.cost` coins and yields `pricing.per` resource units.
    /// The debit lands first; an account that cannot pay gets nothing.
    pub async fn purchase(&self, account: &str, kind: ResourceKind, amount: u64) -> Result<ResourceSet> {
        if amount == 0 {
            return Err(TalonError::Validation(
                "purchase amount must be positive".to_string(),
            ));
        }
        let pricing = self.shop.pricing(kind);
        if pricing.per == 0 {
            return Err(TalonError::Validation(format!(
                "shop pricing for {} is misconfigured",
                kind
            )));
        }
        let cost = pricing.cost * Decimal::from(amount);
        self.coins.debit(account, cost).await?;
        self.grant(account, kind, amount * pricing.per).await
    }

    /// Plan assigned to the account, falling back to the configured default.
    pub async fn plan_name(&self, account: &str) -> Result<String> {
        Ok(self
            .store
            .get::<String>(&keys::plan(account))
            .await?
            .unwrap_or_else(|| self.plans.default_plan.clone()))
    }

    /// Assign a plan, `None` resets to the default.
    pub async fn set_plan(&self, account: &str, plan: Option<&str>) -> Result<()> {
        match plan {
            Some(name) => {
                if !self.plans.tiers.contains_key(name) {
                    return Err(TalonError::NotFound(format!("plan `{}`", name)));
                }
                self.store.set(&keys::plan(account), &name.to_string()).await
            }
            None => self.store.delete(&keys::plan(account)).await,
        }
    }

    /// Plan allowance plus purchased grants. A plan name that has vanished
    /// from the config degrades to the default tier.
    pub async fn entitlement(&self, account: &str) -> Result<ResourceSet> {
        let plan = self.plan_name(account).await?;
        let base = self
            .plans
            .tiers
            .get(&plan)
            .or_else(|| self.plans.tiers.get(&self.plans.default_plan))
            .copied()
            .unwrap_or_default();
        Ok(base.plus(&self.grants(account).await?))
    }
}
