use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::NotifierConfig;
use crate::error::Result;
use crate::store::{keys, LedgerStore};

/// Operator-facing events. Fire-and-forget: a lost alert never fails the
/// operation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    SuspectedAlt {
        account: String,
        existing: String,
        ip: String,
    },
    AdminCoinsSet {
        account: String,
        amount: Decimal,
    },
    AdminCoinsAdded {
        account: String,
        amount: Decimal,
    },
    CouponCreated {
        code: String,
    },
    CouponRevoked {
        code: String,
    },
    CouponRedeemed {
        account: String,
        code: String,
    },
    GiftSent {
        from: String,
        to: String,
        amount: Decimal,
    },
    InstanceCreated {
        owner: String,
        name: String,
    },
    DeadLettered {
        owner: String,
        name: String,
        reason: String,
    },
    TransferStuck {
        id: String,
        from: String,
        to: String,
        amount: Decimal,
    },
    StaleTopupClaim {
        intent_id: String,
    },
    BindingRemoved {
        ip: String,
        account: String,
    },
}

impl AlertEvent {
    pub fn title(&self) -> &'static str {
        match self {
            AlertEvent::SuspectedAlt { .. } => "suspected alt",
            AlertEvent::AdminCoinsSet { .. } => "set coins",
            AlertEvent::AdminCoinsAdded { .. } => "added coins",
            AlertEvent::CouponCreated { .. } => "created coupon",
            AlertEvent::CouponRevoked { .. } => "revoked coupon",
            AlertEvent::CouponRedeemed { .. } => "redeemed coupon",
            AlertEvent::GiftSent { .. } => "gifted coins",
            AlertEvent::InstanceCreated { .. } => "created instance",
            AlertEvent::DeadLettered { .. } => "dead-lettered instance",
            AlertEvent::TransferStuck { .. } => "stuck transfer",
            AlertEvent::StaleTopupClaim { .. } => "took over stale top-up claim",
            AlertEvent::BindingRemoved { .. } => "removed ip binding",
        }
    }

    pub fn description(&self) -> String {
        match self {
            AlertEvent::SuspectedAlt { account, existing, ip } => {
                format!("{} logged in from {} already bound to {}", account, ip, existing)
            }
            AlertEvent::AdminCoinsSet { account, amount } => {
                format!("balance of {} set to {}", account, amount)
            }
            AlertEvent::AdminCoinsAdded { account, amount } => {
                format!("{} coins added to {}", amount, account)
            }
            AlertEvent::CouponCreated { code } => format!("coupon `{}` created", code),
            AlertEvent::CouponRevoked { code } => format!("coupon `{}` revoked", code),
            AlertEvent::CouponRedeemed { account, code } => {
                format!("{} redeemed coupon `{}`", account, code)
            }
            AlertEvent::GiftSent { from, to, amount } => {
                format!("{} gifted {} coins to {}", from, amount, to)
            }
            AlertEvent::InstanceCreated { owner, name } => {
                format!("instance `{}` created for {}", name, owner)
            }
            AlertEvent::DeadLettered { owner, name, reason } => {
                format!("instance `{}` for {} gave up: {}", name, owner, reason)
            }
            AlertEvent::TransferStuck { id, from, to, amount } => format!(
                "transfer {} of {} coins from {} to {} did not settle, flagged for reconciliation",
                id, amount, from, to
            ),
            AlertEvent::StaleTopupClaim { intent_id } => format!(
                "intent {} was re-confirmed after an abandoned claim, check for a duplicate credit",
                intent_id
            ),
            AlertEvent::BindingRemoved { ip, account } => {
                format!("binding {} -> {} removed", ip, account)
            }
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: AlertEvent);
}

/// Posts events to a Discord-compatible webhook. Delivery failures are
/// logged and swallowed.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(config: &NotifierConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: config.webhook_url.clone(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: AlertEvent) {
        let body = serde_json::json!({
            "embeds": [{
                "color": 0xFFFFFF,
                "title": format!("Event: `{}`", event.title()),
                "description": event.description(),
                "author": { "name": "Talon Logging" },
            }]
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("webhook returned {}", response.status());
            }
            Ok(_) => debug!("delivered alert: {}", event.title()),
            Err(e) => warn!("webhook delivery failed: {}", e),
        }
    }
}

/// Drops every event. Used when the webhook is disabled.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: AlertEvent) {}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub message: String,
    pub created_ms: i64,
}

/// Per-account notification inbox, newest first, bounded.
pub struct NoteBox {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    cap: usize,
}

impl NoteBox {
    pub fn new(store: LedgerStore, clock: Arc<dyn Clock>, cap: usize) -> Self {
        Self { store, clock, cap }
    }

    pub async fn push(&self, account: &str, message: &str) -> Result<()> {
        let note = Note {
            message: message.to_string(),
            created_ms: self.clock.now_millis(),
        };
        let cap = self.cap;
        self.store
            .update::<Vec<Note>, _>(&keys::notifications(account), |notes| {
                let mut notes = notes.unwrap_or_default();
                notes.insert(0, note.clone());
                notes.truncate(cap);
                Ok(Some(notes))
            })
            .await?;
        Ok(())
    }

    pub async fn notes(&self, account: &str) -> Result<Vec<Note>> {
        Ok(self
            .store
            .get::<Vec<Note>>(&keys::notifications(account))
            .await?
            .unwrap_or_default())
    }

    pub async fn clear(&self, account: &str) -> Result<()> {
        self.store.delete(&keys::notifications(account)).await
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every event for assertions.
    pub struct CollectingNotifier {
        pub events: Mutex<Vec<AlertEvent>>,
    }

    impl CollectingNotifier {
        pub fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }

        pub fn take(&self) -> Vec<AlertEvent> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl Notifier for CollectingNotifier {
        async fn notify(&self, event: AlertEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::starting_at(
            chrono::Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_inbox_is_newest_first_and_bounded() {
        let notebox = NoteBox::new(LedgerStore::in_memory(), clock(), 3);
        for i in 0..5 {
            notebox.push("alice", &format!("note {}", i)).await.unwrap();
        }
        let notes = notebox.notes("alice").await.unwrap();
        assert_eq!(notes.len(), 3);
        assert_eq!(notes[0].message, "note 4");
        assert_eq!(notes[2].message, "note 2");

        notebox.clear("alice").await.unwrap();
        assert!(notebox.notes("alice").await.unwrap().is_empty());
    }
}
