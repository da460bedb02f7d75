//! Tier capability matrix.

use serde::{Deserialize, Serialize};

use crate::types::Tier;

/// Capability flags derived from a tenant's effective tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapabilities {
    pub may_queue: bool,
    pub max_queue_size: i64,
    pub may_learn_patterns: bool,
    pub may_use_custom_limits: bool,
    pub priority_queue_enabled: bool,
}

impl TierCapabilities {
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                may_queue: false,
                max_queue_size: 0,
                may_learn_patterns: false,
                may_use_custom_limits: false,
                priority_queue_enabled: false,
            },
            Tier::Pro => Self {
                may_queue: true,
                max_queue_size: 100,
                may_learn_patterns: true,
                may_use_custom_limits: true,
                priority_queue_enabled: true,
            },
        }
    }

    /// Queue capacity in force for a tenant: the per-tenant override when
    /// set, otherwise the tier default.
    pub fn effective_queue_capacity(&self, tenant_max_queue_size: i64) -> i64 {
        if tenant_max_queue_size > 0 {
            tenant_max_queue_size
        } else {
            self.max_queue_size
        }
    }
}
