mod balance;
mod fees;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ActionsConfig;
use crate::error::EngineError;
use crate::stats::NodeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Channel,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Variable {
    Balance,
    FeeRate,
}

/// One recommendation for the operator. Nothing here is executed by the
/// advisor itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub entity: Entity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub alias: Option<String>,
    pub priority: u32,
    pub variable: Variable,
    pub actual: i64,
    pub target: i64,
    pub max: i64,
    pub reason: String,
}

/// Pure, synchronous advisory engine over one snapshot's statistics.
///
/// Construction validates the configuration and the snapshot invariants;
/// `get()` derives the full ordered action batch. The same inputs always
/// produce the same output.
#[derive(Debug)]
pub struct ActionsEngine<'a> {
    config: &'a ActionsConfig,
    stats: &'a NodeStats,
    now: DateTime<Utc>,
}

impl<'a> ActionsEngine<'a> {
    pub fn new(
        config: &'a ActionsConfig,
        stats: &'a NodeStats,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        check_snapshot(stats)?;
        Ok(Self { config, stats, now })
    }

    /// All recommendations, in emission order: per-channel balance actions,
    /// the node-level balance action, then per-channel fee actions.
    /// Zero-priority balance actions mean "do nothing" and are dropped.
    pub fn get(&self) -> Result<Vec<Action>, EngineError> {
        let mut assessments = BTreeMap::new();
        for (id, channel) in &self.stats.channels {
            assessments.insert(id.clone(), balance::balance_target(channel, self.config));
        }

        let mut actions = Vec::new();

        for (id, channel) in &self.stats.channels {
            let action = balance::channel_balance_action(channel, &assessments[id], self.config);
            if action.priority > 0 {
                actions.push(action);
            }
        }

        if !self.stats.channels.is_empty() {
            let action = balance::node_balance_action(self.stats, &assessments, self.config);
            if action.priority > 0 {
                actions.push(action);
            }
        }

        for channel in self.stats.channels.values() {
            if let Some(action) =
                fees::channel_fee_action(channel, &assessments, self.stats, self.config, self.now)?
            {
                actions.push(action);
            }
        }

        Ok(actions)
    }
}

fn check_snapshot(stats: &NodeStats) -> Result<(), EngineError> {
    for (id, channel) in &stats.channels {
        if id != &channel.properties.id {
            return Err(EngineError::SnapshotInvariant(format!(
                "stats key {} does not match channel id {}",
                id, channel.properties.id
            )));
        }
        if channel.properties.local_balance > channel.properties.capacity {
            return Err(EngineError::SnapshotInvariant(format!(
                "channel {}: local balance {} exceeds capacity {}",
                id, channel.properties.local_balance, channel.properties.capacity
            )));
        }
        let mut previous: Option<DateTime<Utc>> = None;
        for change in &channel.history {
            if let Some(previous) = previous {
                if change.time() > previous {
                    return Err(EngineError::SnapshotInvariant(format!(
                        "channel {}: history is not ordered latest-first",
                        id
                    )));
                }
            }
            if change.balance() > channel.properties.capacity {
                return Err(EngineError::SnapshotInvariant(format!(
                    "channel {}: history balance {} exceeds capacity {}",
                    id,
                    change.balance(),
                    channel.properties.capacity
                )));
            }
            previous = Some(change.time());
        }
    }
    Ok(())
}
