//! Node wiring: opens the shared store, builds every engine around it and
//! runs the background tasks. Multiple node processes may point at the
//! same store; nothing here keeps cross-request state in memory.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::antifraud::AltGuard;
use crate::clock::{Clock, SystemClock};
use crate::config::TalonConfig;
use crate::coupons::CouponBook;
use crate::error::Result;
use crate::ledger::coins::CoinLedger;
use crate::ledger::resources::ResourceLedger;
use crate::limiter::RateLimiter;
use crate::notifier::{NoteBox, Notifier, NullNotifier, WebhookNotifier};
use crate::payments::{DisabledGateway, PaymentGateway, PaymentsDesk};
use crate::provisioner::{HttpProvisioner, Provisioner};
use crate::queue::ProvisionQueue;
use crate::referrals::ReferralDesk;
use crate::rewards::RewardsDesk;
use crate::staking::StakingEngine;
use crate::store::LedgerStore;

pub struct TalonNode {
    pub config: TalonConfig,
    pub store: LedgerStore,
    pub coins: CoinLedger,
    pub resources: ResourceLedger,
    pub staking: StakingEngine,
    pub coupons: CouponBook,
    pub alt_guard: AltGuard,
    pub limiter: RateLimiter,
    pub rewards: RewardsDesk,
    pub referrals: ReferralDesk,
    pub payments: PaymentsDesk,
    pub queue: Arc<ProvisionQueue>,
    pub notes: NoteBox,
}

impl TalonNode {
    /// Production entry point: sled store, system clock, HTTP provisioner.
    /// The payment gateway stays disabled until a processor is wired in.
    pub fn open(config: TalonConfig) -> Result<Self> {
        let store = LedgerStore::open(&config.node.db_path)?;
        let notifier: Arc<dyn Notifier> = if config.notifier.enabled {
            Arc::new(WebhookNotifier::new(&config.notifier))
        } else {
            Arc::new(NullNotifier)
        };
        let provisioner = Arc::new(HttpProvisioner::new(&config.provisioner));
        Ok(Self::build(
            config,
            store,
            Arc::new(SystemClock),
            provisioner,
            Arc::new(DisabledGateway),
            notifier,
        ))
    }

    /// Wire every engine around an existing store and collaborators. Tests
    /// inject the memory store, a manual clock and mocks through here.
    pub fn build(
        config: TalonConfig,
        store: LedgerStore,
        clock: Arc<dyn Clock>,
        provisioner: Arc<dyn Provisioner>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let coins = CoinLedger::new(
            store.clone(),
            clock.clone(),
            notifier.clone(),
            config.ledger.transfer_stuck_secs,
        );
        let resources = ResourceLedger::new(
            store.clone(),
            coins.clone(),
            config.shop.clone(),
            config.plans.clone(),
        );
        let staking = StakingEngine::new(
            store.clone(),
            coins.clone(),
            clock.clone(),
            config.staking.clone(),
        );
        let coupons = CouponBook::new(
            store.clone(),
            coins.clone(),
            resources.clone(),
            notifier.clone(),
        );
        let alt_guard = AltGuard::new(store.clone(), notifier.clone(), config.antifraud.clone());
        let limiter = RateLimiter::new(store.clone(), clock.clone(), config.limiter.clone());
        let rewards = RewardsDesk::new(
            store.clone(),
            coins.clone(),
            limiter.clone(),
            clock.clone(),
            config.rewards.clone(),
        );
        let referrals = ReferralDesk::new(
            store.clone(),
            coins.clone(),
            clock.clone(),
            config.referrals.clone(),
        );
        let payments = PaymentsDesk::new(
            store.clone(),
            coins.clone(),
            gateway,
            clock.clone(),
            notifier.clone(),
            config.packages.clone(),
            config.ledger.history_cap,
        );
        let queue = Arc::new(ProvisionQueue::new(
            store.clone(),
            clock.clone(),
            resources.clone(),
            provisioner,
            notifier,
            config.templates.clone(),
            config.provisioner.locations.clone(),
            config.queue.clone(),
        ));
        let notes = NoteBox::new(store.clone(), clock, config.ledger.history_cap);

        Self {
            config,
            store,
            coins,
            resources,
            staking,
            coupons,
            alt_guard,
            limiter,
            rewards,
            referrals,
            payments,
            queue,
            notes,
        }
    }

    /// Background consumer of the provisioning queue. The conditional
    /// claim inside `drain` keeps concurrent node processes from
    /// double-creating, so running this on every node is safe.
    pub fn spawn_drainer(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let period = Duration::from_secs(self.config.queue.drain_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match queue.drain().await {
                    Ok(report) if report.claimed > 0 => {
                        info!(
                            "drain cycle: {} claimed, {} created, {} retried, {} dead-lettered",
                            report.claimed, report.created, report.retried, report.dead_lettered
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("queue drain failed: {}", e),
                }
            }
        })
    }

    /// Periodic sweep for transfers that died between their debit and
    /// credit legs.
    pub fn spawn_transfer_sweeper(&self) -> JoinHandle<()> {
        let coins = self.coins.clone();
        let period = Duration::from_secs(self.config.ledger.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match coins.sweep_transfers().await {
                    Ok(0) => {}
                    Ok(flagged) => info!("transfer sweep flagged {} entries", flagged),
                    Err(e) => error!("transfer sweep failed: {}", e),
                }
            }
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.store.flush().await
    }
}
