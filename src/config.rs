use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ledger::resources::{ResourceKind, ResourceSet};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TalonConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub staking: StakingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub referrals: ReferralConfig,
    #[serde(default)]
    pub shop: ShopConfig,
    #[serde(default)]
    pub plans: PlanConfig,
    #[serde(default)]
    pub packages: HashMap<String, CoinPackage>,
    #[serde(default)]
    pub templates: HashMap<String, TemplateInfo>,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub antifraud: AntifraudConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    pub db_path: String,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LedgerConfig {
    /// Debited journal entries older than this are flagged for reconciliation.
    pub transfer_stuck_secs: u64,
    pub sweep_interval_secs: u64,
    pub history_cap: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            transfer_stuck_secs: 900,
            sweep_interval_secs: 300,
            history_cap: 50,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StakingConfig {
    pub min_stake: Decimal,
    /// Simple (non-compounding) interest rate per 24h of elapsed time.
    pub daily_rate: Decimal,
    pub unstake_cooldown_secs: u64,
    /// Credit accrued earnings before a new stake resets the anchor.
    pub settle_before_stake: bool,
    /// Restart accrual from zero after a partial unstake.
    pub reset_anchor_on_unstake: bool,
}

impl Default for StakingConfig {
    fn default() -> Self {
        Self {
            min_stake: Decimal::from(10),
            daily_rate: Decimal::new(5, 2),
            unstake_cooldown_secs: 86_400,
            settle_before_stake: false,
            reset_anchor_on_unstake: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub drain_interval_secs: u64,
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_base_secs: u64,
    pub dead_letter_cap: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            drain_interval_secs: 300,
            max_attempts: 3,
            retry_base_secs: 300,
            dead_letter_cap: 200,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimiterConfig {
    pub create_window_secs: u64,
    pub create_max: u32,
    pub earn_daily_limit: u32,
    pub earn_cooldown_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            create_window_secs: 3,
            create_max: 1,
            earn_daily_limit: 50,
            earn_cooldown_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RewardsConfig {
    pub daily_coins: Decimal,
    pub earn_coins: Decimal,
    pub afk_coins_per_minute: Decimal,
    pub afk_interval_secs: u64,
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            daily_coins: Decimal::from(150),
            earn_coins: Decimal::from(10),
            afk_coins_per_minute: Decimal::new(15, 1),
            afk_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReferralConfig {
    pub owner_bonus: Decimal,
    pub claimer_bonus: Decimal,
    pub code_max_len: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            owner_bonus: Decimal::from(80),
            claimer_bonus: Decimal::from(250),
            code_max_len: 15,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Pricing {
    pub cost: Decimal,
    /// Units granted per purchase of `cost` coins.
    pub per: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ShopConfig {
    pub ram: Pricing,
    pub disk: Pricing,
    pub cpu: Pricing,
    pub servers: Pricing,
}

impl ShopConfig {
    pub fn pricing(&self, kind: ResourceKind) -> &Pricing {
        match kind {
            ResourceKind::Ram => &self.ram,
            ResourceKind::Disk => &self.disk,
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Servers => &self.servers,
        }
    }
}

impl Default for ShopConfig {
    fn default() -> Self {
        Self {
            ram: Pricing {
                cost: Decimal::from(125),
                per: 1024,
            },
            disk: Pricing {
                cost: Decimal::from(100),
                per: 1024,
            },
            cpu: Pricing {
                cost: Decimal::from(150),
                per: 100,
            },
            servers: Pricing {
                cost: Decimal::from(200),
                per: 1,
            },
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlanConfig {
    pub default_plan: String,
    pub tiers: HashMap<String, ResourceSet>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "default".to_string(),
            ResourceSet {
                ram: 1024,
                disk: 1024,
                cpu: 100,
                servers: 1,
            },
        );
        Self {
            default_plan: "default".to_string(),
            tiers,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CoinPackage {
    pub price: Decimal,
    pub coins: Decimal,
}

/// Panel-side template a queued instance is created from. The provisioner
/// merges this with the per-request name, owner and limits.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TemplateInfo {
    pub egg: u32,
    pub docker_image: String,
    pub startup: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProvisionerConfig {
    pub endpoint: String,
    pub token: String,
    pub timeout_secs: u64,
    pub locations: Vec<u32>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://panel.example.com".to_string(),
            token: String::new(),
            timeout_secs: 10,
            locations: vec![1],
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AntifraudConfig {
    pub duplicate_check: bool,
    #[serde(default)]
    pub blocked_ips: Vec<String>,
}

impl Default for AntifraudConfig {
    fn default() -> Self {
        Self {
            duplicate_check: true,
            blocked_ips: vec![],
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NotifierConfig {
    pub enabled: bool,
    pub webhook_url: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
        }
    }
}

impl Default for TalonConfig {
    fn default() -> Self {
        let mut packages = HashMap::new();
        packages.insert(
            "small".to_string(),
            CoinPackage {
                price: Decimal::new(499, 2),
                coins: Decimal::from(500),
            },
        );
        packages.insert(
            "large".to_string(),
            CoinPackage {
                price: Decimal::new(1999, 2),
                coins: Decimal::from(2400),
            },
        );
        let mut templates = HashMap::new();
        templates.insert(
            "paper".to_string(),
            TemplateInfo {
                egg: 3,
                docker_image: "ghcr.io/pterodactyl/yolks:java_17".to_string(),
                startup: "java -Xms128M -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}}"
                    .to_string(),
                environment: HashMap::from([
                    ("SERVER_JARFILE".to_string(), "server.jar".to_string()),
                    ("BUILD_NUMBER".to_string(), "latest".to_string()),
                ]),
            },
        );
        Self {
            node: NodeConfig {
                db_path: "./data/ledger".to_string(),
                log_level: "info".to_string(),
            },
            ledger: LedgerConfig::default(),
            staking: StakingConfig::default(),
            queue: QueueConfig::default(),
            limiter: LimiterConfig::default(),
            rewards: RewardsConfig::default(),
            referrals: ReferralConfig::default(),
            shop: ShopConfig::default(),
            plans: PlanConfig::default(),
            packages,
            templates,
            provisioner: ProvisionerConfig::default(),
            antifraud: AntifraudConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl TalonConfig {
    pub fn load_or_default(path: &str) -> Self {
        if std::path::Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(s) => match toml::from_str(&s) {
                    Ok(c) => {
                        println!("Config loaded from {}", path);
                        c
                    }
                    Err(e) => {
                        eprintln!("Error parsing config: {}. Using Defaults.", e);
                        Self::default()
                    }
                },
                Err(e) => {
                    eprintln!("Error reading config: {}. Using Defaults.", e);
                    Self::default()
                }
            }
        } else {
            println!("Config file not found at '{}'. Creating default.", path);
            let config = Self::default();
            if let Ok(s) = toml::to_string_pretty(&config) {
                let _ = std::fs::write(path, s);
            }
            config
        }
    }
}
