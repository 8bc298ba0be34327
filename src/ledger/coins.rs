//! Coin balance ledger. Balances never go negative: every debit re-checks
//! funds inside the conditional write that applies it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::require_positive;
use crate::clock::Clock;
use crate::error::{Result, TalonError};
use crate::notifier::{AlertEvent, Notifier};
use crate::store::{keys, LedgerStore};

/// Ceiling for admin balance writes. Regular credits are uncapped.
fn max_coins() -> Decimal {
    Decimal::from(999_999_999_999_999i64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TransferState {
    Prepared,
    Debited,
}

/// Journal entry covering the window between a transfer's debit and credit.
/// Settled transfers are removed; anything that lingers is picked up by
/// [`CoinLedger::sweep_transfers`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub state: TransferState,
    pub created_ms: i64,
}

#[derive(Clone)]
pub struct CoinLedger {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    stuck_after_ms: i64,
}

impl CoinLedger {
    pub fn new(
        store: LedgerStore,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        stuck_after_secs: u64,
    ) -> Self {
        Self {
            store,
            clock,
            notifier,
            stuck_after_ms: stuck_after_secs as i64 * 1000,
        }
    }

    /// Current balance, zero for accounts that have never held coins.
    pub async fn balance(&self, account: &str) -> Result<Decimal> {
        Ok(self
            .store
            .get::<Decimal>(&keys::coins(account))
            .await?
            .unwrap_or(Decimal::ZERO))
    }

    /// Add coins. Returns the new balance.
    pub async fn credit(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        require_positive(amount)?;
        let written = self
            .store
            .update::<Decimal, _>(&keys::coins(account), |current| {
                Ok(Some(current.unwrap_or(Decimal::ZERO) + amount))
            })
            .await?;
        Ok(written.unwrap_or(Decimal::ZERO))
    }

    /// Remove coins, rejecting any debit that would go below zero.
    /// Returns the new balance.
    pub async fn debit(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        require_positive(amount)?;
        let written = self
            .store
            .update::<Decimal, _>(&keys::coins(account), |current| {
                let balance = current.unwrap_or(Decimal::ZERO);
                if balance < amount {
                    return Err(TalonError::InsufficientFunds {
                        balance,
                        required: amount,
                    });
                }
                Ok(Some(balance - amount))
            })
            .await?;
        Ok(written.unwrap_or(Decimal::ZERO))
    }

    /// Admin override. Zero removes the record entirely.
    pub async fn set_balance(&self, account: &str, amount: Decimal) -> Result<()> {
        if amount < Decimal::ZERO {
            return Err(TalonError::Validation(
                "balance cannot be negative".to_string(),
            ));
        }
        if amount > max_coins() {
            return Err(TalonError::Validation(format!(
                "balance cannot exceed {}",
                max_coins()
            )));
        }
        if amount.is_zero() {
            self.store.delete(&keys::coins(account)).await?;
        } else {
            self.store.set(&keys::coins(account), &amount).await?;
        }
        self.notifier
            .notify(AlertEvent::AdminCoinsSet {
                account: account.to_string(),
                amount,
            })
            .await;
        Ok(())
    }

    /// Admin credit, capped at the ceiling.
    pub async fn add_coins(&self, account: &str, amount: Decimal) -> Result<Decimal> {
        require_positive(amount)?;
        let written = self
            .store
            .update::<Decimal, _>(&keys::coins(account), |current| {
                let next = current.unwrap_or(Decimal::ZERO) + amount;
                if next > max_coins() {
                    return Err(TalonError::Validation(format!(
                        "balance cannot exceed {}",
                        max_coins()
                    )));
                }
                Ok(Some(next))
            })
            .await?;
        self.notifier
            .notify(AlertEvent::AdminCoinsAdded {
                account: account.to_string(),
                amount,
            })
            .await;
        Ok(written.unwrap_or(Decimal::ZERO))
    }

    /// Gift coins between accounts. The store has no multi-key transactions,
    /// so the debit and credit are journaled; a transfer that dies between
    /// the two legs is flagged by the sweeper instead of silently losing
    /// coins.
    pub async fn transfer(&self, from: &str, to: &str, amount: Decimal) -> Result<()> {
        require_positive(amount)?;
        if from == to {
            return Err(TalonError::SelfTransfer);
        }
        let record = TransferRecord {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: to.to_string(),
            amount,
            state: TransferState::Prepared,
            created_ms: self.clock.now_millis(),
        };
        self.journal_push(&record).await?;

        if let Err(e) = self.debit(from, amount).await {
            self.journal_remove(record.id).await?;
            return Err(e);
        }
        self.journal_mark_debited(record.id).await?;
        self.credit(to, amount).await?;
        self.journal_remove(record.id).await?;

        self.notifier
            .notify(AlertEvent::GiftSent {
                from: from.to_string(),
                to: to.to_string(),
                amount,
            })
            .await;
        Ok(())
    }

    /// Moves journal entries older than the threshold onto the
    /// reconciliation list and raises an alert for each. Deliberately never
    /// re-credits anything itself; an operator settles flagged entries.
    pub async fn sweep_transfers(&self) -> Result<usize> {
        let cutoff = self.clock.now_millis() - self.stuck_after_ms;
        let mut found: Vec<TransferRecord> = Vec::new();
        self.store
            .update::<Vec<TransferRecord>, _>(&keys::transfer_journal(), |journal| {
                found.clear();
                let mut keep = Vec::new();
                for entry in journal.unwrap_or_default() {
                    if entry.created_ms <= cutoff {
                        found.push(entry);
                    } else {
                        keep.push(entry);
                    }
                }
                Ok(Some(keep))
            })
            .await?;
        if found.is_empty() {
            return Ok(0);
        }

        self.store
            .update::<Vec<TransferRecord>, _>(&keys::transfer_stuck(), |stuck| {
                let mut stuck = stuck.unwrap_or_default();
                stuck.extend(found.iter().cloned());
                Ok(Some(stuck))
            })
            .await?;

        for entry in &found {
            warn!(
                "transfer {} ({} -> {}, {} coins) flagged for reconciliation",
                entry.id, entry.from, entry.to, entry.amount
            );
            self.notifier
                .notify(AlertEvent::TransferStuck {
                    id: entry.id.to_string(),
                    from: entry.from.clone(),
                    to: entry.to.clone(),
                    amount: entry.amount,
                })
                .await;
        }
        Ok(found.len())
    }

    /// Entries the sweeper flagged, awaiting manual settlement.
    pub async fn stuck_transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .store
            .get::<Vec<TransferRecord>>(&keys::transfer_stuck())
            .await?
            .unwrap_or_default())
    }

    /// Pending (in-flight) journal entries.
    pub async fn pending_transfers(&self) -> Result<Vec<TransferRecord>> {
        Ok(self
            .store
            .get::<Vec<TransferRecord>>(&keys::transfer_journal())
            .await?
            .unwrap_or_default())
    }

    async fn journal_push(&self, record: &TransferRecord) -> Result<()> {
        self.store
            .update::<Vec<TransferRecord>, _>(&keys::transfer_journal(), |journal| {
                let mut journal = journal.unwrap_or_default();
                journal.push(record.clone());
                Ok(Some(journal))
            })
            .await?;
        Ok(())
    }

    async fn journal_mark_debited(&self, id: Uuid) -> Result<()> {
        self.store
            .update::<Vec<TransferRecord>, _>(&keys::transfer_journal(), |journal| {
                let mut journal = journal.unwrap_or_default();
                for entry in journal.iter_mut() {
                    if entry.id == id {
                        entry.state = TransferState::Debited;
                    }
                }
                Ok(Some(journal))
            })
            .await?;
        Ok(())
    }

    async fn journal_remove(&self, id: Uuid) -> Result<()> {
        self.store
            .update::<Vec<TransferRecord>, _>(&keys::transfer_journal(), |journal| {
                let mut journal = journal.unwrap_or_default();
                journal.retain(|entry| entry.id != id);
                Ok(Some(journal))
            })
            .await?;
        Ok(())
    }
}
