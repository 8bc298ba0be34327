use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TalonError>;

/// Crate-wide error taxonomy. Business-rule failures are terminal for the
/// caller; `Store` and `Serialization` mean the shared store itself
/// misbehaved and are the only kinds worth paging anyone over.
#[derive(Error, Debug)]
pub enum TalonError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: balance {balance}, required {required}")]
    InsufficientFunds { balance: Decimal, required: Decimal },
    #[error("insufficient staked balance: staked {staked}, requested {requested}")]
    InsufficientStake { staked: Decimal, requested: Decimal },
    #[error("cannot transfer coins to yourself")]
    SelfTransfer,
    #[error("coupon `{0}` was already redeemed by this account")]
    AlreadyRedeemed(String),
    #[error("invalid or unknown code")]
    InvalidCode,
    #[error("cooldown active, {} seconds remaining", .remaining.as_secs())]
    CooldownActive { remaining: Duration },
    #[error("no earnings to claim")]
    NothingToClaim,
    #[error("rate limited, retry in {} seconds", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("suspected alt of account {existing}")]
    SuspectedAlt { existing: String },
    #[error("provisioning queue is full")]
    QueueFull,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("payment intent {0} was already processed")]
    Replay(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TalonError {
    /// Redirect tag understood by the panel front end. The request boundary
    /// owns the final mapping; this only exposes the historical vocabulary
    /// so integrators do not have to invent their own.
    pub fn boundary_tag(&self) -> &'static str {
        match self {
            TalonError::Validation(_) => "INVALID",
            TalonError::NotFound(_) => "NOTFOUND",
            TalonError::InsufficientFunds { .. } => "CANTAFFORD",
            TalonError::InsufficientStake { .. } => "INSUFFICIENTSTAKE",
            TalonError::SelfTransfer => "CANNOTGIFTYOURSELF",
            TalonError::AlreadyRedeemed(_) => "ALREADYUSED",
            TalonError::InvalidCode => "INVALIDCODE",
            TalonError::CooldownActive { .. } => "COOLDOWN",
            TalonError::NothingToClaim => "NOTHINGTOCLAIM",
            TalonError::RateLimited { .. } => "RATELIMIT",
            TalonError::SuspectedAlt { .. } => "ANTIALT",
            TalonError::QueueFull => "QUEUEFULL",
            TalonError::Upstream(_) => "UPSTREAM",
            TalonError::Replay(_) => "ALREADYPROCESSED",
            TalonError::Store(_) | TalonError::Serialization(_) => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_tags_match_panel_vocabulary() {
        let err = TalonError::InsufficientFunds {
            balance: Decimal::ZERO,
            required: Decimal::ONE,
        };
        assert_eq!(err.boundary_tag(), "CANTAFFORD");
        assert_eq!(
            TalonError::AlreadyRedeemed("save10".into()).boundary_tag(),
            "ALREADYUSED"
        );
        assert_eq!(
            TalonError::CooldownActive {
                remaining: Duration::from_secs(60)
            }
            .boundary_tag(),
            "COOLDOWN"
        );
    }
}
