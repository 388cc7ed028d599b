//! Pre-generation quota check and post-generation charge.
//!
//! Policy: a logged-in user first spends the model's free-daily allowance
//! (tripled for Standard members); after that each generation is metered
//! against points (flat-priced models) or balance (token-priced models).
//! Active Premium members are never charged. Precheck and settle are not an
//! atomic reservation, so two concurrent generations may both pass.

use std::sync::Arc;

use chrono::Utc;

use crate::config::BillingConfig;
use crate::dispatch::{ModelInfo, Pricing, TokenUsage};
use crate::error::RelayError;
use crate::store::{Account, AccountStore, Tier, UsageLedger, UsageRecord};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ticket {
    /// Nothing is charged (Premium, or anonymous in legacy mode).
    Exempt,
    /// Covered by the free-daily allowance.
    Free,
    /// Charged at settle, scaled by `discount`.
    Metered { discount: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow(Ticket),
    Deny(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Charge {
    Points { amount: f64, remaining: f64 },
    Balance { amount: f64, remaining: f64 },
}

pub struct BillingGate {
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn UsageLedger>,
    config: BillingConfig,
}

impl BillingGate {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn UsageLedger>,
        config: BillingConfig,
    ) -> Self {
        Self {
            accounts,
            ledger,
            config,
        }
    }

    pub fn discount(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Free => 1.0,
            Tier::Standard => self.config.standard_discount,
            Tier::Premium => self.config.premium_discount,
        }
    }

    pub fn max_tokens_for(&self, tier: Tier) -> u64 {
        let caps = &self.config.max_tokens;
        match tier {
            Tier::Free => caps.free,
            Tier::Standard => caps.standard,
            Tier::Premium => caps.premium,
        }
    }

    /// Today's free allowance for `tier` on `model`.
    pub fn free_limit(&self, tier: Tier, model: &ModelInfo) -> u64 {
        match tier {
            Tier::Standard => model
                .free_daily
                .saturating_mul(self.config.standard_free_multiplier),
            _ => model.free_daily,
        }
    }

    pub async fn precheck(&self, account: Option<&Account>, model: &ModelInfo) -> Decision {
        let Some(account) = account else {
            return if self.config.enforce {
                Decision::Deny("please sign in to use this model".to_string())
            } else {
                Decision::Allow(Ticket::Exempt)
            };
        };

        let tier = account.effective_tier(Utc::now());
        if tier == Tier::Premium {
            return Decision::Allow(Ticket::Exempt);
        }

        let used = match self.ledger.count_today(&account.user_id, &model.name).await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(user_id = %account.user_id, model = %model.name, error = %e,
                    "usage count unavailable, metering this generation");
                None
            }
        };
        if let Some(used) = used {
            if used < self.free_limit(tier, model) {
                return Decision::Allow(Ticket::Free);
            }
        }

        let discount = self.discount(tier);
        let sufficient = match model.pricing {
            Pricing::Tokens { .. } => account.balance > 0.0,
            Pricing::Points(cost) => account.points >= cost * discount,
        };
        if sufficient {
            Decision::Allow(Ticket::Metered { discount })
        } else {
            let what = match model.pricing {
                Pricing::Tokens { .. } => "balance",
                Pricing::Points(_) => "points",
            };
            Decision::Deny(format!(
                "insufficient {what}, please top up or check in to continue"
            ))
        }
    }

    /// Append one usage record, which also counts towards the free allowance.
    pub async fn record_usage(
        &self,
        user_id: &str,
        model: &str,
        usage: TokenUsage,
    ) -> Result<(), RelayError> {
        self.ledger
            .record(UsageRecord {
                user_id: user_id.to_string(),
                model: model.to_string(),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                estimated: usage.estimated,
                at: Utc::now(),
            })
            .await
    }

    /// Charge a finished generation. Only metered tickets cost anything.
    pub async fn settle(
        &self,
        user_id: &str,
        model: &ModelInfo,
        ticket: Ticket,
        usage: TokenUsage,
    ) -> Result<Option<Charge>, RelayError> {
        let Ticket::Metered { discount } = ticket else {
            return Ok(None);
        };
        if discount <= 0.0 {
            return Ok(None);
        }

        let charge = match model.pricing {
            Pricing::Points(cost) => {
                let amount = cost * discount;
                let remaining = self.accounts.add_points(user_id, -amount).await?;
                Charge::Points { amount, remaining }
            }
            Pricing::Tokens { per_1k } => {
                let amount = usage.total() as f64 / 1000.0 * per_1k * discount;
                let remaining = self.accounts.add_balance(user_id, -amount).await?;
                Charge::Balance { amount, remaining }
            }
        };

        tracing::info!(user_id, model = %model.name, ?charge, "generation settled");
        Ok(Some(charge))
    }
}
