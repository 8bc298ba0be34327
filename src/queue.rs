//! Rate-limited provisioning queue. Requests are appended to a shared list
//! in the store and drained by periodic worker ticks; a conditional
//! claim-and-remove keeps concurrent workers from double-creating. Items
//! that keep failing back off exponentially and eventually land on a
//! bounded dead-letter list instead of wedging the queue head.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{QueueConfig, TemplateInfo};
use crate::error::{Result, TalonError};
use crate::ledger::resources::{ResourceLedger, ResourceSet};
use crate::notifier::{AlertEvent, Notifier};
use crate::provisioner::{CreateSpec, DeployFlags, InstanceLimits, Provisioner};
use crate::store::{keys, LedgerStore};

const CLAIM_RETRIES: usize = 16;
const MAX_NAME_LEN: usize = 64;

/// What the boundary hands us after its own authentication.
#[derive(Debug, Clone)]
pub struct NewServerRequest {
    pub owner: String,
    pub name: String,
    pub template: String,
    pub limits: InstanceLimits,
    pub location: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedServer {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub template: String,
    pub limits: InstanceLimits,
    pub location: u32,
    pub queued_at_ms: i64,
    pub attempts: u32,
    /// Not eligible for claiming before this instant.
    pub next_attempt_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub request: QueuedServer,
    pub reason: String,
    pub failed_at_ms: i64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub created: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

pub struct ProvisionQueue {
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    resources: ResourceLedger,
    provisioner: Arc<dyn Provisioner>,
    notifier: Arc<dyn Notifier>,
    templates: HashMap<String, TemplateInfo>,
    locations: Vec<u32>,
    config: QueueConfig,
}

impl ProvisionQueue {
    pub fn new(
        store: LedgerStore,
        clock: Arc<dyn Clock>,
        resources: ResourceLedger,
        provisioner: Arc<dyn Provisioner>,
        notifier: Arc<dyn Notifier>,
        templates: HashMap<String, TemplateInfo>,
        locations: Vec<u32>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            clock,
            resources,
            provisioner,
            notifier,
            templates,
            locations,
            config,
        }
    }

    /// Validate and append a creation request. `current_usage` is the
    /// caller's live resource consumption; admission compares usage plus
    /// the new instance against the account's entitlement.
    pub async fn enqueue(
        &self,
        request: NewServerRequest,
        current_usage: &ResourceSet,
    ) -> Result<QueuedServer> {
        let name = request.name.trim().to_string();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(TalonError::Validation(format!(
                "instance name must be 1..={} characters",
                MAX_NAME_LEN
            )));
        }
        if !self.templates.contains_key(&request.template) {
            return Err(TalonError::NotFound(format!(
                "template `{}`",
                request.template
            )));
        }
        if !self.locations.contains(&request.location) {
            return Err(TalonError::Validation(format!(
                "location {} is not offered",
                request.location
            )));
        }

        let entitlement = self.resources.entitlement(&request.owner).await?;
        let mut requested = current_usage.plus(&ResourceSet {
            ram: request.limits.memory,
            disk: request.limits.disk,
            cpu: request.limits.cpu,
            servers: 0,
        });
        requested.servers = current_usage.servers.saturating_add(1);
        if !entitlement.covers(&requested) {
            return Err(TalonError::Validation(
                "requested limits exceed the account's resources".to_string(),
            ));
        }

        let now = self.clock.now_millis();
        let item = QueuedServer {
            id: Uuid::new_v4(),
            owner: request.owner.clone(),
            name,
            template: request.template.clone(),
            limits: request.limits,
            location: request.location,
            queued_at_ms: now,
            attempts: 0,
            next_attempt_ms: now,
        };

        self.push_global(&item, true).await?;
        self.push_account(&item).await?;
        self.store.flush().await?;
        info!("queued instance `{}` for {}", item.name, item.owner);
        Ok(item)
    }

    /// One drain cycle: claim and process every item that is currently due.
    /// The budget is the queue length at entry, so items re-queued for
    /// retry within this cycle cannot make it spin.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let budget = self.pending().await?.len();
        for _ in 0..budget {
            let Some(item) = self.claim_next().await? else {
                break;
            };
            report.claimed += 1;
            self.process(item, &mut report).await?;
        }
        if report.claimed > 0 {
            self.store.flush().await?;
        }
        Ok(report)
    }

    /// Conditionally remove the first due item. Losing the swap means
    /// another worker got there first; after a few attempts we yield the
    /// rest of the tick.
    async fn claim_next(&self) -> Result<Option<QueuedServer>> {
        let now = self.clock.now_millis();
        for _ in 0..CLAIM_RETRIES {
            let current = self
                .store
                .get::<Vec<QueuedServer>>(&keys::queue())
                .await?
                .unwrap_or_default();
            let Some(position) = current.iter().position(|item| item.next_attempt_ms <= now)
            else {
                return Ok(None);
            };
            let mut remaining = current.clone();
            let item = remaining.remove(position);
            let next = if remaining.is_empty() {
                None
            } else {
                Some(&remaining)
            };
            let swapped = self
                .store
                .compare_and_swap(&keys::queue(), Some(&current), next)
                .await?;
            if swapped {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    async fn process(&self, mut item: QueuedServer, report: &mut DrainReport) -> Result<()> {
        let Some(template) = self.templates.get(&item.template) else {
            report.dead_lettered += 1;
            self.dead_letter(item, "unknown template".to_string()).await?;
            return Ok(());
        };
        let spec = CreateSpec {
            owner: item.owner.clone(),
            name: item.name.clone(),
            limits: item.limits,
            deploy: DeployFlags {
                locations: vec![item.location],
                dedicated_ip: false,
                port_range: vec![],
            },
            template: template.clone(),
        };

        match self.provisioner.create_instance(&spec).await {
            Ok(()) => {
                report.created += 1;
                self.remove_account(&item).await?;
                info!("created instance `{}` for {}", item.name, item.owner);
                self.notifier
                    .notify(AlertEvent::InstanceCreated {
                        owner: item.owner.clone(),
                        name: item.name.clone(),
                    })
                    .await;
            }
            Err(e) => {
                item.attempts += 1;
                if item.attempts >= self.config.max_attempts {
                    report.dead_lettered += 1;
                    self.dead_letter(item, e.to_string()).await?;
                } else {
                    report.retried += 1;
                    let factor = 1u64 << (item.attempts - 1).min(16);
                    item.next_attempt_ms = self.clock.now_millis()
                        + (self.config.retry_base_secs * factor * 1000) as i64;
                    warn!(
                        "instance `{}` for {} failed (attempt {}): {}, retrying",
                        item.name, item.owner, item.attempts, e
                    );
                    // Retries bypass the capacity gate, a full queue must
                    // not drop work it already accepted
                    self.push_global(&item, false).await?;
                    self.refresh_account(&item).await?;
                }
            }
        }
        Ok(())
    }

    /// Global queue snapshot, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueuedServer>> {
        Ok(self
            .store
            .get::<Vec<QueuedServer>>(&keys::queue())
            .await?
            .unwrap_or_default())
    }

    /// Outstanding requests for one account.
    pub async fn pending_for(&self, account: &str) -> Result<Vec<QueuedServer>> {
        Ok(self
            .store
            .get::<Vec<QueuedServer>>(&keys::queue_for(account))
            .await?
            .unwrap_or_default())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self
            .store
            .get::<Vec<DeadLetter>>(&keys::dead_letters())
            .await?
            .unwrap_or_default())
    }

    /// Admin: put a dead-lettered request back on the queue with a clean
    /// attempt counter.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<QueuedServer> {
        let mut taken: Option<DeadLetter> = None;
        self.store
            .update::<Vec<DeadLetter>, _>(&keys::dead_letters(), |letters| {
                let mut letters = letters.unwrap_or_default();
                match letters.iter().position(|l| l.request.id == id) {
                    Some(position) => {
                        taken = Some(letters.remove(position));
                        Ok(Some(letters))
                    }
                    None => Err(TalonError::NotFound(format!("dead letter {}", id))),
                }
            })
            .await?;
        let Some(letter) = taken else {
            return Err(TalonError::NotFound(format!("dead letter {}", id)));
        };

        let mut item = letter.request.clone();
        item.attempts = 0;
        item.next_attempt_ms = self.clock.now_millis();
        if let Err(e) = self.push_global(&item, true).await {
            // Queue is full; put the letter back rather than losing it
            self.store
                .update::<Vec<DeadLetter>, _>(&keys::dead_letters(), |letters| {
                    let mut letters = letters.unwrap_or_default();
                    letters.push(letter.clone());
                    Ok(Some(letters))
                })
                .await?;
            return Err(e);
        }
        self.push_account(&item).await?;
        Ok(item)
    }

    async fn push_global(&self, item: &QueuedServer, enforce_capacity: bool) -> Result<()> {
        let capacity = self.config.capacity;
        self.store
            .update::<Vec<QueuedServer>, _>(&keys::queue(), |queue| {
                let mut queue = queue.unwrap_or_default();
                if enforce_capacity && queue.len() >= capacity {
                    return Err(TalonError::QueueFull);
                }
                queue.push(item.clone());
                Ok(Some(queue))
            })
            .await?;
        Ok(())
    }

    async fn push_account(&self, item: &QueuedServer) -> Result<()> {
        self.store
            .update::<Vec<QueuedServer>, _>(&keys::queue_for(&item.owner), |queue| {
                let mut queue = queue.unwrap_or_default();
                queue.push(item.clone());
                Ok(Some(queue))
            })
            .await?;
        Ok(())
    }

    /// Overwrite the per-account copy so `pending_for` shows the same
    /// attempt counter and retry time as the global queue.
    async fn refresh_account(&self, item: &QueuedServer) -> Result<()> {
        self.store
            .update::<Vec<QueuedServer>, _>(&keys::queue_for(&item.owner), |queue| {
                let mut queue = queue.unwrap_or_default();
                if let Some(entry) = queue.iter_mut().find(|entry| entry.id == item.id) {
                    *entry = item.clone();
                }
                Ok(Some(queue))
            })
            .await?;
        Ok(())
    }

    async fn remove_account(&self, item: &QueuedServer) -> Result<()> {
        self.store
            .update::<Vec<QueuedServer>, _>(&keys::queue_for(&item.owner), |queue| {
                let mut queue = queue.unwrap_or_default();
                queue.retain(|entry| entry.id != item.id);
                if queue.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(queue))
                }
            })
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, item: QueuedServer, reason: String) -> Result<()> {
        self.remove_account(&item).await?;
        warn!(
            "instance `{}` for {} dead-lettered: {}",
            item.name, item.owner, reason
        );
        self.notifier
            .notify(AlertEvent::DeadLettered {
                owner: item.owner.clone(),
                name: item.name.clone(),
                reason: reason.clone(),
            })
            .await;
        let cap = self.config.dead_letter_cap;
        let letter = DeadLetter {
            request: item,
            reason,
            failed_at_ms: self.clock.now_millis(),
        };
        self.store
            .update::<Vec<DeadLetter>, _>(&keys::dead_letters(), |letters| {
                let mut letters = letters.unwrap_or_default();
                while letters.len() >= cap && !letters.is_empty() {
                    letters.remove(0);
                }
                letters.push(letter.clone());
                Ok(Some(letters))
            })
            .await?;
        Ok(())
    }
}
