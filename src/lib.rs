pub mod antifraud;
pub mod clock;
pub mod config;
pub mod coupons;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod node;
pub mod notifier;
pub mod payments;
pub mod provisioner;
pub mod queue;
pub mod referrals;
pub mod rewards;
pub mod staking;
pub mod store;
