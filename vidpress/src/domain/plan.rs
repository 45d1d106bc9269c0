//! Subscription plans and the entitlement they grant.

use serde::{Deserialize, Serialize};

use crate::database::models::OwnerDbModel;

/// Subscription plan tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Standard,
    Pro,
    Premium,
    Ultra,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Pro => "pro",
            Self::Premium => "premium",
            Self::Ultra => "ultra",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Maximum number of queue entries an owner on this plan may hold,
    /// including the one currently running.
    pub fn queue_limit(&self) -> usize {
        match self {
            Self::Ultra => 10,
            Self::Premium => 3,
            Self::Standard | Self::Pro => 1,
        }
    }

    /// Ultra never lapses, even if an expiry was recorded.
    pub fn expires(&self) -> bool {
        !matches!(self, Self::Ultra)
    }
}

/// What an owner is allowed to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    None,
    Active { plan: Plan, queue_limit: usize },
    Admin { queue_limit: usize },
}

impl Entitlement {
    /// Resolve the entitlement of an owner at `now_ms`.
    pub fn resolve(owner: Option<&OwnerDbModel>, is_admin: bool, now_ms: i64) -> Self {
        if is_admin {
            return Self::Admin {
                queue_limit: Plan::Ultra.queue_limit(),
            };
        }

        let Some(owner) = owner else {
            return Self::None;
        };
        let Some(plan) = owner.plan.as_deref().and_then(Plan::parse) else {
            return Self::None;
        };

        let lapsed = plan.expires() && owner.expires_at.is_some_and(|at| at <= now_ms);
        if lapsed {
            Self::None
        } else {
            Self::Active {
                plan,
                queue_limit: plan.queue_limit(),
            }
        }
    }

    pub fn is_entitled(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn queue_limit(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Active { queue_limit, .. } | Self::Admin { queue_limit } => *queue_limit,
        }
    }
}
