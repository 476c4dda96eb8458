use std::collections::BTreeMap;

use crate::config::ActionsConfig;
use crate::stats::{ChannelStats, NodeStats};

use super::{Action, Entity, Variable};

/// Normalized signed offset of a balance from its target, in [-1, 1].
/// Negative means depleted, positive overfull. The denominator switches at
/// the target so the range holds even for off-center targets.
pub(crate) fn distance(balance: u64, target: u64, capacity: u64) -> f64 {
    let b = balance as f64;
    let t = target as f64;
    if balance <= target {
        b / t - 1.0
    } else {
        (b - t) / (capacity as f64 - t)
    }
}

/// Priority bands: one band per `min_rebalance_distance` of offset. A zero
/// priority means "do nothing" and is filtered before emission.
pub(crate) fn priority(base: u32, distance: f64, min_rebalance_distance: f64) -> u32 {
    base * (distance.abs() / min_rebalance_distance).floor() as u32
}

/// A channel's computed balance target with the explanation that produced it.
#[derive(Debug, Clone)]
pub(crate) struct BalanceAssessment {
    pub target: u64,
    pub reason: String,
}

/// Derive the target local balance for one channel from its forward flow.
pub(crate) fn balance_target(stats: &ChannelStats, config: &ActionsConfig) -> BalanceAssessment {
    let props = &stats.properties;
    let capacity = props.capacity as f64;

    let in_sum = stats.in_forwards.total_tokens;
    let out_sum = stats.out_forwards.total_tokens;
    let forwards = stats.in_forwards.count + stats.out_forwards.count;

    if forwards < config.min_channel_forwards || in_sum + out_sum == 0 {
        return BalanceAssessment {
            target: (0.5 * capacity).round() as u64,
            reason: format!(
                "Only {} forwards in {} days ({} needed to predict flow)",
                forwards, config.days, config.min_channel_forwards
            ),
        };
    }

    let optimal = (out_sum as f64 / (in_sum + out_sum) as f64 * capacity).round() as i64;

    // Headroom to absorb a repeat of the largest forward in each direction.
    let margin = 1.0 + config.largest_forward_margin_fraction;
    let min_forward_balance = (stats.out_forwards.max_tokens as f64 * margin).round() as i64;
    let max_forward_balance =
        (capacity - stats.in_forwards.max_tokens as f64 * margin).round() as i64;

    if min_forward_balance > max_forward_balance {
        // The largest forwards in both directions cannot fit at once.
        // TODO: recommend a capacity increase for channels that hit this.
        return BalanceAssessment {
            target: (0.5 * capacity).round() as u64,
            reason: "Largest forwards in both directions exceed the available capacity".to_string(),
        };
    }

    let min_balance = (config.min_channel_balance_fraction * capacity).round() as i64;
    let max_balance = props.capacity as i64 - min_balance;

    let (target, reason) = if optimal < min_balance {
        (
            min_balance,
            format!(
                "Flow suggests {} sats but the balance floor is {} sats",
                optimal, min_balance
            ),
        )
    } else if optimal > max_balance {
        (
            max_balance,
            format!(
                "Flow suggests {} sats but the balance ceiling is {} sats",
                optimal, max_balance
            ),
        )
    } else if optimal < min_forward_balance {
        (
            min_forward_balance,
            format!(
                "Raised to {} sats to keep room for the largest outbound forward",
                min_forward_balance
            ),
        )
    } else if optimal > max_forward_balance {
        (
            max_forward_balance,
            format!(
                "Lowered to {} sats to keep room for the largest inbound forward",
                max_forward_balance
            ),
        )
    } else {
        (
            optimal,
            format!("Forward flow over {} days", config.days),
        )
    };

    BalanceAssessment {
        target: target as u64,
        reason,
    }
}

pub(crate) fn channel_balance_action(
    stats: &ChannelStats,
    assessment: &BalanceAssessment,
    config: &ActionsConfig,
) -> Action {
    let props = &stats.properties;
    let dist = distance(props.local_balance, assessment.target, props.capacity);
    Action {
        entity: Entity::Channel,
        id: Some(props.id.clone()),
        alias: props.partner_alias.clone(),
        priority: priority(1, dist, config.min_rebalance_distance),
        variable: Variable::Balance,
        actual: props.local_balance as i64,
        target: assessment.target as i64,
        max: props.capacity as i64,
        reason: assessment.reason.clone(),
    }
}

pub(crate) fn node_balance_action(
    stats: &NodeStats,
    assessments: &BTreeMap<String, BalanceAssessment>,
    config: &ActionsConfig,
) -> Action {
    let mut actual = 0u64;
    let mut target = 0u64;
    let mut max = 0u64;
    for (id, channel) in &stats.channels {
        actual += channel.properties.local_balance;
        max += channel.properties.capacity;
        if let Some(assessment) = assessments.get(id) {
            target += assessment.target;
        }
    }
    let dist = distance(actual, target, max);
    Action {
        entity: Entity::Node,
        id: None,
        alias: None,
        priority: priority(4, dist, config.min_rebalance_distance),
        variable: Variable::Balance,
        actual: actual as i64,
        target: target as i64,
        max: max as i64,
        reason: "Sum of target balances of all channels.".to_string(),
    }
}
