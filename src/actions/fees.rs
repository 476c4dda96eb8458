use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

use crate::config::ActionsConfig;
use crate::error::EngineError;
use crate::snapshot::ChannelInfo;
use crate::stats::changes::Change;
use crate::stats::{ChannelStats, NodeStats};

use super::balance::{distance, priority, BalanceAssessment};
use super::{Action, Entity, Variable};

/// Increases never target less than this; near-zero historical rates would
/// otherwise produce meaningless proposals.
const MIN_INCREASED_FEE_RATE: i64 = 30;

/// Forwards at most this old count as an emergency, scaling the increase to
/// its full fraction instead of by elapsed time.
const EMERGENCY_WINDOW_MS: i64 = 5 * 60 * 1000;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Derive at most one fee-rate proposal for a channel.
///
/// The channel's own balance target decides which branch applies: deep
/// depletion asks for an increase anchored on the forwards that caused it,
/// a healthy balance lets the rate decay toward zero over the window, and a
/// mild depletion fed by overfull sibling channels prices that drain up.
pub(crate) fn channel_fee_action(
    stats: &ChannelStats,
    assessments: &BTreeMap<String, BalanceAssessment>,
    all: &NodeStats,
    config: &ActionsConfig,
    now: DateTime<Utc>,
) -> Result<Option<Action>, EngineError> {
    let props = &stats.properties;
    let target = assessments
        .get(&props.id)
        .ok_or_else(|| {
            EngineError::Computation(format!("no balance target computed for channel {}", props.id))
        })?
        .target;
    let current_distance = distance(props.local_balance, target, props.capacity);

    let last_out = stats.history.iter().find(|c| c.is_out_forward());
    let last_out_rate = last_out_fee_rate(stats, config);

    let (last_out, last_out_rate) = match (last_out, last_out_rate) {
        (Some(last_out), Some(rate)) => (last_out, rate),
        // No outbound forward, or too little volume to trust a rate: all we
        // can do for a channel past its first window is pick an extreme.
        _ => return Ok(no_rate_action(props, current_distance, config, now)),
    };

    if current_distance <= -config.min_fee_increase_distance {
        // Deep depletion. Reprice from the forwards that drained the channel.
        let candidates = below_bounds_out_forwards(&stats.history, target, props, config);
        if !candidates.is_empty() {
            let new_rate = increase_fee_rate(&candidates, &stats.history, target, props, now, config)?;
            if new_rate > props.fee_rate as i64 {
                let reason = format!(
                    "Balance {} sats is far below target {}; forwards during the depletion underpriced the liquidity",
                    props.local_balance, target
                );
                return Ok(Some(fee_action(props, new_rate, current_distance, config, reason)));
            }
        }
    } else {
        // Healthy zone. Let the rate decay from its last supported anchor.
        let not_below = stats
            .history
            .iter()
            .take_while(|c| distance(c.balance(), target, props.capacity) > -config.min_fee_increase_distance)
            .count();
        if not_below == 0 {
            return Err(EngineError::Computation(format!(
                "channel {}: newest history balance contradicts its current distance",
                props.id
            )));
        }
        let not_below_start = stats.history[not_below - 1].time();

        let outcome = if not_below_start > last_out.time() {
            // No outbound forward since the depletion ended. Rebuild the
            // rate as it stood at the exit and decay from that moment.
            let depleted = &stats.history[not_below..];
            let candidates = below_bounds_out_forwards(depleted, target, props, config);
            if candidates.is_empty() {
                DecreaseOutcome::NotDue
            } else {
                let exit_rate =
                    increase_fee_rate(&candidates, depleted, target, props, not_below_start, config)?;
                try_decrease(exit_rate, now - not_below_start, stats, config)
            }
        } else {
            try_decrease(last_out_rate, now - last_out.time(), stats, config)
        };

        match outcome {
            DecreaseOutcome::Attempted(Some(new_rate)) => {
                let reason = format!(
                    "No outbound forward for {:.1} days; decaying the rate toward its floor",
                    (now - last_out.time()).num_milliseconds() as f64 / MS_PER_DAY
                );
                return Ok(Some(fee_action(props, new_rate, current_distance, config, reason)));
            }
            DecreaseOutcome::Attempted(None) => return Ok(None),
            DecreaseOutcome::NotDue => {}
        }
    }

    if current_distance <= -config.min_rebalance_distance {
        return inflow_increase(stats, target, last_out_rate, current_distance, assessments, all, config);
    }

    Ok(None)
}

/// Case of no usable outbound rate: channels past their first window get an
/// extreme rate, everything younger is left alone.
fn no_rate_action(
    props: &ChannelInfo,
    current_distance: f64,
    config: &ActionsConfig,
    now: DateTime<Utc>,
) -> Option<Action> {
    if now - props.opened_at < Duration::days(config.days as i64) {
        return None;
    }
    let (new_rate, reason) = if current_distance <= -config.min_fee_increase_distance {
        (
            config.max_fee_rate as i64,
            format!(
                "Depleted without outbound forwards in {} days; price the remaining liquidity at the cap",
                config.days
            ),
        )
    } else {
        (
            0,
            format!(
                "No outbound forwards in {} days; remove the fee barrier",
                config.days
            ),
        )
    };
    if new_rate == props.fee_rate as i64 {
        return None;
    }
    Some(fee_action(props, new_rate, current_distance, config, reason))
}

/// Fee rate implied by recent outbound forwards, or `None` when they moved
/// less than `min_out_fee_forward_fraction` of capacity.
///
/// The walk keeps accumulating until the total *before* the current forward
/// already met the threshold, so it includes one forward beyond the minimum.
fn last_out_fee_rate(stats: &ChannelStats, config: &ActionsConfig) -> Option<i64> {
    let min_amount = config.min_out_fee_forward_fraction * stats.properties.capacity as f64;
    let mut total = 0i64;
    let mut fees_msat = 0u64;
    let mut included = 0u32;
    for change in &stats.history {
        if let Change::OutForward { amount, fee_msat, .. } = change {
            let before = total;
            total += amount;
            fees_msat += fee_msat;
            included += 1;
            if before as f64 >= min_amount {
                break;
            }
        }
    }
    if (total as f64) < min_amount || total == 0 {
        return None;
    }
    let net_fee_msat =
        fees_msat as f64 - included as f64 * stats.properties.base_fee_msat as f64;
    Some((net_fee_msat / 1000.0 / total as f64 * 1_000_000.0).round() as i64)
}

/// Outbound forwards within the leading stretch of history where the
/// channel sat below bounds, latest-first.
fn below_bounds_out_forwards<'a>(
    history: &'a [Change],
    target: u64,
    props: &ChannelInfo,
    config: &ActionsConfig,
) -> Vec<&'a Change> {
    let mut forwards = Vec::new();
    for change in history {
        if distance(change.balance(), target, props.capacity) > -config.min_fee_increase_distance {
            break;
        }
        if change.is_out_forward() {
            forwards.push(change);
        }
    }
    forwards
}

/// The most aggressive repricing among the forwards that drove a channel
/// below bounds: recent forwards demand their full correction at once,
/// older ones scale with elapsed time.
fn increase_fee_rate(
    candidates: &[&Change],
    history: &[Change],
    target: u64,
    props: &ChannelInfo,
    eval_time: DateTime<Utc>,
    config: &ActionsConfig,
) -> Result<i64, EngineError> {
    let newest = history.first().ok_or_else(|| {
        EngineError::Computation(format!("channel {}: fee increase over empty history", props.id))
    })?;
    if candidates.is_empty() {
        return Err(EngineError::Computation(format!(
            "channel {}: fee increase without below-bounds outbound forwards",
            props.id
        )));
    }

    let raw_fraction = distance(newest.balance(), target, props.capacity).abs()
        - config.min_fee_increase_distance;

    let mut best = i64::MIN;
    for forward in candidates {
        let forward_rate = (forward.fee_msat() as f64 - props.base_fee_msat as f64)
            / 1000.0
            / forward.amount() as f64
            * 1_000_000.0;
        let elapsed_ms = (eval_time - forward.time()).num_milliseconds();
        let add_fraction = if elapsed_ms < EMERGENCY_WINDOW_MS {
            raw_fraction
        } else {
            let elapsed_days = elapsed_ms as f64 / MS_PER_DAY;
            raw_fraction * elapsed_days * config.fee_increase_multiplier / config.days as f64
        };
        let new_rate = ((forward_rate * (1.0 + add_fraction)).round() as i64)
            .max(MIN_INCREASED_FEE_RATE)
            .min(config.max_fee_rate as i64);
        if new_rate > best {
            best = new_rate;
        }
    }
    Ok(best)
}

enum DecreaseOutcome {
    /// Still inside the wait period; the caller may consider other moves.
    NotDue,
    /// A decrease was due; `Some` carries a rate strictly below the current
    /// one, `None` means the floor already holds it up.
    Attempted(Option<i64>),
}

/// Decay a fee rate linearly over the remainder of the window, floored by
/// what recent rebalances and the peer's own rate imply.
fn try_decrease(
    base_rate: i64,
    elapsed: Duration,
    stats: &ChannelStats,
    config: &ActionsConfig,
) -> DecreaseOutcome {
    let elapsed_days =
        elapsed.num_milliseconds() as f64 / MS_PER_DAY - config.fee_decrease_wait_days as f64;
    if elapsed_days <= 0.0 {
        return DecreaseOutcome::NotDue;
    }
    let decrease_fraction = elapsed_days / (config.days - config.fee_decrease_wait_days) as f64;
    let candidate = (base_rate as f64 * (1.0 - decrease_fraction)).round() as i64;
    let new_rate = min_fee_rate(stats, config).max(candidate);
    if new_rate < stats.properties.fee_rate as i64 {
        DecreaseOutcome::Attempted(Some(new_rate))
    } else {
        DecreaseOutcome::Attempted(None)
    }
}

/// Floor for decreases: a channel that depends on paid rebalances for its
/// inflow must not price below what that inflow costs, nor below the
/// partner's rate.
fn min_fee_rate(stats: &ChannelStats, config: &ActionsConfig) -> i64 {
    let rates: Vec<f64> = stats
        .history
        .iter()
        .filter(|c| c.is_in_rebalance())
        .take(3)
        .map(|c| {
            (c.fee_msat() as f64 / 1000.0 / c.amount().unsigned_abs() as f64 * 1_000_000.0).round()
        })
        .collect();
    if rates.is_empty() {
        return 0;
    }
    let rebalance_rate = (rates.iter().sum::<f64>() / rates.len() as f64).round() as i64;

    let in_sum = stats.in_forwards.total_tokens;
    let out_sum = stats.out_forwards.total_tokens;
    let inflow_fraction = in_sum as f64 / (in_sum + out_sum) as f64;
    if !inflow_fraction.is_finite() || inflow_fraction > config.min_inflow_fraction {
        // Forwards already bring enough inflow; rebalance cost is sunk.
        return 0;
    }
    rebalance_rate.max(stats.properties.partner_fee_rate.unwrap_or(0) as i64)
}

struct FeederInflow {
    label: String,
    inflow: u64,
    distance: f64,
    earliest: DateTime<Utc>,
}

/// A mildly depleted channel whose outflow arrives through overfull
/// channels is draining liquidity that costs nothing to replace; price the
/// drain up in proportion to how lopsided the feeders are.
fn inflow_increase(
    stats: &ChannelStats,
    target: u64,
    last_out_rate: i64,
    current_distance: f64,
    assessments: &BTreeMap<String, BalanceAssessment>,
    all: &NodeStats,
    config: &ActionsConfig,
) -> Result<Option<Action>, EngineError> {
    let props = &stats.properties;

    let mut feeder_ids: Vec<&String> = Vec::new();
    for change in &stats.history {
        if let Change::OutForward {
            in_channel: Some(id),
            ..
        } = change
        {
            if !feeder_ids.contains(&id) {
                feeder_ids.push(id);
            }
        }
    }

    let mut feeders: Vec<FeederInflow> = Vec::new();
    for id in feeder_ids {
        let feeder = all.channels.get(id).ok_or_else(|| {
            EngineError::SnapshotInvariant(format!(
                "channel {} referenced in history of {} is missing from the snapshot",
                id, props.id
            ))
        })?;
        let feeder_target = assessments
            .get(id)
            .ok_or_else(|| {
                EngineError::Computation(format!("no balance target computed for channel {}", id))
            })?
            .target;
        let feeder_props = &feeder.properties;
        let feeder_distance =
            distance(feeder_props.local_balance, feeder_target, feeder_props.capacity);
        if feeder_distance < config.min_fee_increase_distance {
            continue;
        }

        let mut inflow = 0u64;
        let mut earliest = None;
        for change in &feeder.history {
            if distance(change.balance(), feeder_target, feeder_props.capacity)
                < config.min_fee_increase_distance
            {
                break;
            }
            if let Change::InForward {
                out_channel: Some(out),
                amount,
                time,
                ..
            } = change
            {
                if out == &props.id {
                    inflow += amount.unsigned_abs();
                    earliest = Some(*time);
                }
            }
        }
        let Some(earliest) = earliest else { continue };

        feeders.push(FeederInflow {
            label: feeder_props
                .partner_alias
                .clone()
                .unwrap_or_else(|| id.clone()),
            inflow,
            distance: feeder_distance,
            earliest,
        });
    }

    let Some(earliest) = feeders.iter().map(|f| f.earliest).min() else {
        return Ok(None);
    };

    let total_outflow: u64 = stats
        .history
        .iter()
        .filter(|c| c.is_out_forward() && c.time() >= earliest)
        .map(|c| c.amount().unsigned_abs())
        .sum();
    if total_outflow == 0 {
        return Ok(None);
    }

    let fraction = feeders
        .iter()
        .map(|f| f.inflow as f64 * f.distance)
        .sum::<f64>()
        / total_outflow as f64;
    if fraction <= config.min_fee_increase_distance {
        return Ok(None);
    }

    let increase_fraction =
        (fraction - config.min_fee_increase_distance) * current_distance.abs();
    let new_rate = ((last_out_rate as f64 * (1.0 + increase_fraction)).round() as i64)
        .min(config.max_fee_rate as i64);
    if new_rate <= props.fee_rate as i64 {
        return Ok(None);
    }

    let mut reason = String::from("Outflow is fed by overfull channels:");
    for feeder in &feeders {
        reason.push_str(&format!(
            " {} ({} sats at distance {:.2});",
            feeder.label, feeder.inflow, feeder.distance
        ));
    }
    Ok(Some(fee_action(props, new_rate, current_distance, config, reason)))
}

fn fee_action(
    props: &ChannelInfo,
    new_rate: i64,
    current_distance: f64,
    config: &ActionsConfig,
    reason: String,
) -> Action {
    Action {
        entity: Entity::Channel,
        id: Some(props.id.clone()),
        alias: props.partner_alias.clone(),
        priority: priority(1, current_distance, config.min_rebalance_distance).max(1),
        variable: Variable::FeeRate,
        actual: props.fee_rate as i64,
        target: new_rate,
        max: config.max_fee_rate as i64,
        reason,
    }
}
