//! Coin top-ups through an external payment gateway. Confirmation is
//! idempotent per intent: a processed marker is claimed with a conditional
//! write before any coins move, so replayed callbacks and racing workers
//! cannot credit twice.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::config::CoinPackage;
use crate::error::{Result, TalonError};
use crate::ledger::coins::CoinLedger;
use crate::notifier::{AlertEvent, Notifier};
use crate::store::{keys, LedgerStore};

/// A claim older than this belongs to a confirmation that died mid-flight
/// and may be taken over.
const STALE_CLAIM_MS: i64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Succeeded,
    Processing,
    RequiresPayment,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: Option<String>,
    pub status: IntentStatus,
    pub amount_minor: u64,
    pub currency: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_minor: u64,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent>;

    async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent>;
}

/// Marker stored under `processed-<intentId>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
enum ProcessedEntry {
    Claimed { claimed_ms: i64 },
    Done(TopupReceipt),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopupReceipt {
    pub intent_id: String,
    pub account: String,
    pub coins: Decimal,
    pub credited_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxRecord {
    pub id: String,
    pub kind: String,
    pub coins: Decimal,
    pub created_ms: i64,
}

pub struct PaymentsDesk {
    store: LedgerStore,
    coins: CoinLedger,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    packages: HashMap<String, CoinPackage>,
    history_cap: usize,
}

impl PaymentsDesk {
    pub fn new(
        store: LedgerStore,
        coins: CoinLedger,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        packages: HashMap<String, CoinPackage>,
        history_cap: usize,
    ) -> Self {
        Self {
            store,
            coins,
            gateway,
            clock,
            notifier,
            packages,
            history_cap,
        }
    }

    /// Start a top-up by creating a gateway intent for the chosen package.
    /// The account and coin amount ride along in the intent metadata.
    pub async fn create_topup(&self, account: &str, package: &str) -> Result<PaymentIntent> {
        let Some(pkg) = self.packages.get(package) else {
            return Err(TalonError::NotFound(format!("package `{}`", package)));
        };
        let amount_minor = (pkg.price * Decimal::from(100)).to_u64().ok_or_else(|| {
            TalonError::Validation(format!("package `{}` price is not representable", package))
        })?;
        let metadata = HashMap::from([
            ("account".to_string(), account.to_string()),
            ("coins".to_string(), pkg.coins.to_string()),
            ("package".to_string(), package.to_string()),
        ]);
        self.gateway.create_intent(amount_minor, "usd", metadata).await
    }

    /// Settle a returned intent. Claims the processed marker first; a
    /// second confirmation of the same intent reports `Replay`. The claim
    /// is released again when the intent turns out not to be payable yet,
    /// so the payer can retry later.
    pub async fn confirm_topup(&self, intent_id: &str) -> Result<TopupReceipt> {
        self.claim(intent_id).await?;

        let intent = match self.gateway.retrieve_intent(intent_id).await {
            Ok(intent) => intent,
            Err(e) => {
                self.release(intent_id).await?;
                return Err(e);
            }
        };
        if intent.status != IntentStatus::Succeeded {
            self.release(intent_id).await?;
            return Err(TalonError::Validation(format!(
                "payment intent {} has not succeeded",
                intent_id
            )));
        }

        let Some(account) = intent.metadata.get("account").cloned() else {
            self.release(intent_id).await?;
            return Err(TalonError::Validation(
                "intent metadata is missing the account".to_string(),
            ));
        };
        let coins = intent
            .metadata
            .get("coins")
            .and_then(|raw| raw.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);
        if coins <= Decimal::ZERO {
            self.release(intent_id).await?;
            return Err(TalonError::Validation(
                "intent metadata carries no coin amount".to_string(),
            ));
        }

        self.coins.credit(&account, coins).await?;
        let receipt = TopupReceipt {
            intent_id: intent_id.to_string(),
            account: account.clone(),
            coins,
            credited_ms: self.clock.now_millis(),
        };
        self.store
            .set(
                &keys::processed_intent(intent_id),
                &ProcessedEntry::Done(receipt.clone()),
            )
            .await?;
        self.push_history(&receipt).await?;
        info!(
            "credited {} coins to {} for intent {}",
            coins, account, intent_id
        );
        Ok(receipt)
    }

    /// Receipt for a settled intent, if it ever settled.
    pub async fn receipt(&self, intent_id: &str) -> Result<Option<TopupReceipt>> {
        Ok(
            match self
                .store
                .get::<ProcessedEntry>(&keys::processed_intent(intent_id))
                .await?
            {
                Some(ProcessedEntry::Done(receipt)) => Some(receipt),
                _ => None,
            },
        )
    }

    /// Purchase history, newest first, bounded.
    pub async fn history(&self, account: &str) -> Result<Vec<TxRecord>> {
        Ok(self
            .store
            .get::<Vec<TxRecord>>(&keys::tx_history(account))
            .await?
            .unwrap_or_default())
    }

    async fn claim(&self, intent_id: &str) -> Result<()> {
        let key = keys::processed_intent(intent_id);
        let now = self.clock.now_millis();
        let fresh = ProcessedEntry::Claimed { claimed_ms: now };
        if self
            .store
            .compare_and_swap(&key, None::<&ProcessedEntry>, Some(&fresh))
            .await?
        {
            return Ok(());
        }
        // Marker exists. Take over claims abandoned by a dead worker,
        // report everything else as a replay. A takeover re-credits
        // whenever the dead worker got past its credit, so it is flagged
        // for reconciliation like a stuck transfer.
        match self.store.get::<ProcessedEntry>(&key).await? {
            Some(ProcessedEntry::Claimed { claimed_ms }) if now - claimed_ms > STALE_CLAIM_MS => {
                let stale = ProcessedEntry::Claimed { claimed_ms };
                if self
                    .store
                    .compare_and_swap(&key, Some(&stale), Some(&fresh))
                    .await?
                {
                    self.notifier
                        .notify(AlertEvent::StaleTopupClaim {
                            intent_id: intent_id.to_string(),
                        })
                        .await;
                    Ok(())
                } else {
                    Err(TalonError::Replay(intent_id.to_string()))
                }
            }
            _ => Err(TalonError::Replay(intent_id.to_string())),
        }
    }

    async fn release(&self, intent_id: &str) -> Result<()> {
        self.store.delete(&keys::processed_intent(intent_id)).await
    }

    async fn push_history(&self, receipt: &TopupReceipt) -> Result<()> {
        let record = TxRecord {
            id: receipt.intent_id.clone(),
            kind: "coin_purchase".to_string(),
            coins: receipt.coins,
            created_ms: receipt.credited_ms,
        };
        let cap = self.history_cap;
        self.store
            .update::<Vec<TxRecord>, _>(&keys::tx_history(&receipt.account), |history| {
                let mut history = history.unwrap_or_default();
                history.insert(0, record.clone());
                history.truncate(cap);
                Ok(Some(history))
            })
            .await?;
        Ok(())
    }
}

/// Stands in when no payment processor is wired up. Every call reports the
/// gateway as unavailable; ledger operations are unaffected.
pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn create_intent(
        &self,
        _amount_minor: u64,
        _currency: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent> {
        Err(TalonError::Upstream(
            "payment gateway is not configured".to_string(),
        ))
    }

    async fn retrieve_intent(&self, _id: &str) -> Result<PaymentIntent> {
        Err(TalonError::Upstream(
            "payment gateway is not configured".to_string(),
        ))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory gateway with manually settled intents.
    pub struct MockGateway {
        intents: Mutex<HashMap<String, PaymentIntent>>,
        next_id: Mutex<u64>,
        fail_retrieve: Mutex<bool>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                intents: Mutex::new(HashMap::new()),
                next_id: Mutex::new(1),
                fail_retrieve: Mutex::new(false),
            }
        }

        /// Mark an intent as paid.
        pub fn settle(&self, id: &str) {
            if let Some(intent) = self.intents.lock().unwrap().get_mut(id) {
                intent.status = IntentStatus::Succeeded;
            }
        }

        pub fn set_fail_retrieve(&self, fail: bool) {
            *self.fail_retrieve.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_intent(
            &self,
            amount_minor: u64,
            currency: &str,
            metadata: HashMap<String, String>,
        ) -> Result<PaymentIntent> {
            let mut next_id = self.next_id.lock().unwrap();
            let id = format!("pi_{}", *next_id);
            *next_id += 1;
            let intent = PaymentIntent {
                id: id.clone(),
                client_secret: Some(format!("{}_secret", id)),
                status: IntentStatus::RequiresPayment,
                amount_minor,
                currency: currency.to_string(),
                metadata,
            };
            self.intents.lock().unwrap().insert(id, intent.clone());
            Ok(intent)
        }

        async fn retrieve_intent(&self, id: &str) -> Result<PaymentIntent> {
            if *self.fail_retrieve.lock().unwrap() {
                return Err(TalonError::Upstream("gateway unreachable".to_string()));
            }
            self.intents
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| TalonError::NotFound(format!("intent {}", id)))
        }
    }
}
