//! Account/IP binding against multi-account abuse. The first account seen
//! from an address owns it; later accounts on the same address are held as
//! suspected alts unless flagged for bypass.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::AntifraudConfig;
use crate::error::{Result, TalonError};
use crate::notifier::{AlertEvent, Notifier};
use crate::store::{keys, LedgerStore};

const BIND_RETRIES: usize = 8;

/// Identity payload handed over by the deployment's auth layer after a
/// successful login.
#[derive(Debug, Clone)]
pub struct VerifiedLogin {
    pub account: String,
    pub username: String,
    pub email_verified: bool,
    pub ip: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    /// First login from this address, binding recorded.
    Bound,
    /// Address already bound to this same account.
    AlreadyBound,
    /// Duplicate checking disabled or loopback address.
    Skipped,
    /// Another account owns the address but this one carries the bypass
    /// flag. The existing binding is left alone.
    Bypassed,
}

pub struct AltGuard {
    store: LedgerStore,
    notifier: Arc<dyn Notifier>,
    config: AntifraudConfig,
}

impl AltGuard {
    pub fn new(store: LedgerStore, notifier: Arc<dyn Notifier>, config: AntifraudConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// Login-path entry point: verify the identity payload, then run the
    /// duplicate check for its source address.
    pub async fn screen_login(&self, login: &VerifiedLogin) -> Result<BindingStatus> {
        if !login.email_verified {
            return Err(TalonError::Validation(
                "email address is not verified".to_string(),
            ));
        }
        let ip = normalize_ip(&login.ip)?;
        if self.config.blocked_ips.iter().any(|blocked| blocked == &ip) {
            return Err(TalonError::Validation("address is blocked".to_string()));
        }
        self.bind(&login.account, &ip).await
    }

    /// First-claim-wins binding. `ip` must already be normalized.
    pub async fn bind(&self, account: &str, ip: &str) -> Result<BindingStatus> {
        if !self.config.duplicate_check || is_loopback(ip) {
            return Ok(BindingStatus::Skipped);
        }
        for _ in 0..BIND_RETRIES {
            match self.store.get::<String>(&keys::ip_binding(ip)).await? {
                Some(existing) if existing == account => return Ok(BindingStatus::AlreadyBound),
                Some(existing) => {
                    if self.bypass(account).await? {
                        return Ok(BindingStatus::Bypassed);
                    }
                    self.notifier
                        .notify(AlertEvent::SuspectedAlt {
                            account: account.to_string(),
                            existing: existing.clone(),
                            ip: ip.to_string(),
                        })
                        .await;
                    return Err(TalonError::SuspectedAlt { existing });
                }
                None => {
                    let claimed = self
                        .store
                        .compare_and_swap(
                            &keys::ip_binding(ip),
                            None::<&String>,
                            Some(&account.to_string()),
                        )
                        .await?;
                    if claimed {
                        return Ok(BindingStatus::Bound);
                    }
                    // Lost the claim race; re-read to see who won
                }
            }
        }
        Err(TalonError::Store(
            "contention on ip binding exceeded retries".to_string(),
        ))
    }

    /// Account currently bound to an address, if any.
    pub async fn binding(&self, ip: &str) -> Result<Option<String>> {
        let ip = normalize_ip(ip)?;
        self.store.get::<String>(&keys::ip_binding(&ip)).await
    }

    /// Admin: release an address so the next login rebinds it.
    pub async fn unbind(&self, ip: &str) -> Result<String> {
        let ip = normalize_ip(ip)?;
        let Some(account) = self.store.get::<String>(&keys::ip_binding(&ip)).await? else {
            return Err(TalonError::NotFound(format!("no binding for {}", ip)));
        };
        self.store.delete(&keys::ip_binding(&ip)).await?;
        self.notifier
            .notify(AlertEvent::BindingRemoved {
                ip,
                account: account.clone(),
            })
            .await;
        Ok(account)
    }

    pub async fn bypass(&self, account: &str) -> Result<bool> {
        Ok(self
            .store
            .get::<bool>(&keys::alt_bypass(account))
            .await?
            .unwrap_or(false))
    }

    /// Admin: exempt an account from duplicate detection.
    pub async fn set_bypass(&self, account: &str, enabled: bool) -> Result<()> {
        if enabled {
            self.store.set(&keys::alt_bypass(account), &true).await
        } else {
            self.store.delete(&keys::alt_bypass(account)).await
        }
    }
}

/// Canonical text form of an address. IPv4-mapped IPv6 collapses to plain
/// IPv4 so mixed-stack deployments always bind the same string.
pub fn normalize_ip(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let addr: IpAddr = raw
        .parse()
        .map_err(|_| TalonError::Validation(format!("invalid ip address `{}`", raw)))?;
    Ok(match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    })
}

fn is_loopback(ip: &str) -> bool {
    ip.parse::<IpAddr>()
        .map(|addr| addr.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::testing::CollectingNotifier;

    fn guard(config: AntifraudConfig) -> (AltGuard, Arc<CollectingNotifier>) {
        let notifier = Arc::new(CollectingNotifier::new());
        let guard = AltGuard::new(LedgerStore::in_memory(), notifier.clone(), config);
        (guard, notifier)
    }

    fn login(account: &str, ip: &str) -> VerifiedLogin {
        VerifiedLogin {
            account: account.to_string(),
            username: account.to_string(),
            email_verified: true,
            ip: ip.to_string(),
        }
    }

    #[test]
    fn test_normalize_collapses_mapped_ipv4() {
        assert_eq!(normalize_ip("::ffff:203.0.113.5").unwrap(), "203.0.113.5");
        assert_eq!(normalize_ip("203.0.113.5").unwrap(), "203.0.113.5");
        assert_eq!(normalize_ip("2001:db8::1").unwrap(), "2001:db8::1");
        assert!(normalize_ip("not-an-ip").is_err());
    }

    #[tokio::test]
    async fn test_first_claim_wins() {
        let (guard, notifier) = guard(AntifraudConfig::default());

        let status = guard
            .screen_login(&login("acc-a", "::ffff:203.0.113.5"))
            .await
            .unwrap();
        assert_eq!(status, BindingStatus::Bound);
        assert_eq!(
            guard.binding("203.0.113.5").await.unwrap(),
            Some("acc-a".to_string())
        );

        // Second account on the same address is held, binding unchanged
        let err = guard
            .screen_login(&login("acc-b", "203.0.113.5"))
            .await
            .unwrap_err();
        match err {
            TalonError::SuspectedAlt { existing } => assert_eq!(existing, "acc-a"),
            other => panic!("expected SuspectedAlt, got {:?}", other),
        }
        assert_eq!(
            guard.binding("203.0.113.5").await.unwrap(),
            Some("acc-a".to_string())
        );

        let events = notifier.take();
        assert!(matches!(events.as_slice(), [AlertEvent::SuspectedAlt { .. }]));
    }

    #[tokio::test]
    async fn test_bypass_flag_lets_login_through() {
        let (guard, _) = guard(AntifraudConfig::default());
        guard
            .screen_login(&login("acc-a", "203.0.113.5"))
            .await
            .unwrap();

        guard.set_bypass("acc-b", true).await.unwrap();
        let status = guard
            .screen_login(&login("acc-b", "203.0.113.5"))
            .await
            .unwrap();
        assert_eq!(status, BindingStatus::Bypassed);

        // Binding never moved to the bypassed account
        assert_eq!(
            guard.binding("203.0.113.5").await.unwrap(),
            Some("acc-a".to_string())
        );

        guard.set_bypass("acc-b", false).await.unwrap();
        assert!(guard
            .screen_login(&login("acc-b", "203.0.113.5"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_same_account_and_loopback() {
        let (guard, _) = guard(AntifraudConfig::default());
        guard
            .screen_login(&login("acc-a", "203.0.113.5"))
            .await
            .unwrap();
        assert_eq!(
            guard
                .screen_login(&login("acc-a", "203.0.113.5"))
                .await
                .unwrap(),
            BindingStatus::AlreadyBound
        );

        assert_eq!(
            guard.screen_login(&login("acc-b", "127.0.0.1")).await.unwrap(),
            BindingStatus::Skipped
        );
        assert_eq!(
            guard.screen_login(&login("acc-b", "::1")).await.unwrap(),
            BindingStatus::Skipped
        );
    }

    #[tokio::test]
    async fn test_screen_rejects_unverified_and_blocked() {
        let config = AntifraudConfig {
            duplicate_check: true,
            blocked_ips: vec!["198.51.100.7".to_string()],
        };
        let (guard, _) = guard(config);

        let mut unverified = login("acc-a", "203.0.113.5");
        unverified.email_verified = false;
        assert!(guard.screen_login(&unverified).await.is_err());

        assert!(guard
            .screen_login(&login("acc-a", "198.51.100.7"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_check_skips_binding() {
        let config = AntifraudConfig {
            duplicate_check: false,
            blocked_ips: vec![],
        };
        let (guard, _) = guard(config);
        assert_eq!(
            guard
                .screen_login(&login("acc-a", "203.0.113.5"))
                .await
                .unwrap(),
            BindingStatus::Skipped
        );
        assert_eq!(guard.binding("203.0.113.5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unbind_releases_address() {
        let (guard, _) = guard(AntifraudConfig::default());
        guard
            .screen_login(&login("acc-a", "203.0.113.5"))
            .await
            .unwrap();

        let released = guard.unbind("203.0.113.5").await.unwrap();
        assert_eq!(released, "acc-a");

        // Next login claims it fresh
        assert_eq!(
            guard
                .screen_login(&login("acc-b", "203.0.113.5"))
                .await
                .unwrap(),
            BindingStatus::Bound
        );

        assert!(matches!(
            guard.unbind("192.0.2.1").await.unwrap_err(),
            TalonError::NotFound(_)
        ));
    }
}
