pub mod changes;

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::snapshot::{ChannelInfo, NodeSnapshot};
use changes::Change;

/// Totals over one direction of forwards within the window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardStats {
    pub count: u32,
    pub total_tokens: u64,
    pub max_tokens: u64,
}

impl ForwardStats {
    fn record(&mut self, tokens: u64) {
        self.count += 1;
        self.total_tokens += tokens;
        self.max_tokens = self.max_tokens.max(tokens);
    }
}

/// Per-channel aggregates plus the full change history they derive from.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub properties: ChannelInfo,
    pub in_forwards: ForwardStats,
    pub out_forwards: ForwardStats,
    /// Latest-first.
    pub history: Vec<Change>,
}

impl ChannelStats {
    pub fn new(properties: ChannelInfo, history: Vec<Change>) -> Self {
        let mut in_forwards = ForwardStats::default();
        let mut out_forwards = ForwardStats::default();
        for change in &history {
            match change {
                Change::InForward { amount, .. } => in_forwards.record(amount.unsigned_abs()),
                Change::OutForward { amount, .. } => out_forwards.record(amount.unsigned_abs()),
                _ => {}
            }
        }
        Self {
            properties,
            in_forwards,
            out_forwards,
            history,
        }
    }
}

/// Everything the actions engine consumes: the window length and one
/// `ChannelStats` per channel, keyed by channel id. The key order is the
/// iteration order actions are emitted in.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub days: u32,
    pub channels: BTreeMap<String, ChannelStats>,
}

impl NodeStats {
    pub fn build(snapshot: &NodeSnapshot, days: u32) -> Result<Self, EngineError> {
        let mut channels = BTreeMap::new();
        for channel in &snapshot.channels {
            let history = changes::build_history(channel, &snapshot.forwards, &snapshot.payments)?;
            channels.insert(channel.id.clone(), ChannelStats::new(channel.clone(), history));
        }
        Ok(Self { days, channels })
    }
}
