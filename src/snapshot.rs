use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;

use crate::client::{ChannelEdge, LndClient, PaymentRecord};

/// Immutable per-channel property snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub id: String,
    pub partner_alias: Option<String>,
    /// Satoshis.
    pub capacity: u64,
    /// Satoshis on our side, within [0, capacity].
    pub local_balance: u64,
    /// Our outbound proportional fee, ppm.
    pub fee_rate: u32,
    /// Our outbound base fee, millisatoshis.
    pub base_fee_msat: u32,
    /// The peer's proportional fee toward us, ppm, if the edge is public.
    pub partner_fee_rate: Option<u32>,
    pub opened_at: DateTime<Utc>,
}

/// A settled forward routed through our node.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardEvent {
    pub time: DateTime<Utc>,
    /// Outgoing amount, satoshis.
    pub tokens: u64,
    pub fee_msat: u64,
    pub in_channel: String,
    pub out_channel: String,
}

/// A settled payment initiated by our node.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub time: DateTime<Utc>,
    /// Amount delivered to the destination, satoshis.
    pub tokens: u64,
    pub fee_msat: u64,
    /// First-hop channel the payment left through.
    pub out_channel: Option<String>,
    /// Last-hop channel, ours when the payment is a rebalance.
    pub in_channel: Option<String>,
    /// True when the final hop terminates at our own node.
    pub is_rebalance: bool,
}

/// Immutable view of the node at one instant. A refresh builds a new one;
/// nothing here is ever mutated.
pub struct NodeSnapshot {
    pub node_id: String,
    pub alias: String,
    pub taken_at: DateTime<Utc>,
    pub channels: Vec<ChannelInfo>,
    /// Latest-first within the window.
    pub forwards: Vec<ForwardEvent>,
    /// Latest-first within the window.
    pub payments: Vec<PaymentEvent>,
    /// Failed payments older than the window, for housekeeping.
    pub stale_failed_payments: Vec<String>,
}

impl NodeSnapshot {
    /// Collect a fresh snapshot: identity first, then channels, forwards and
    /// payments concurrently, then per-channel policy enrichment.
    pub async fn collect(client: &(impl LndClient + Sync), days: u32) -> anyhow::Result<Self> {
        let taken_at = Utc::now();
        let window_start = taken_at - Duration::days(days as i64);

        let info = client.get_info().await?;

        let (channel_records, forwards, fetched_payments) = tokio::try_join!(
            client.list_channels(),
            fetch_forwards(client, window_start, taken_at),
            fetch_payments(client, &info.identity_pubkey, window_start),
        )?;

        let fee_report = client.fee_report().await?;
        let fees: HashMap<&str, (u32, u32)> = fee_report
            .iter()
            .map(|f| {
                (
                    f.chan_id.as_str(),
                    (f.fee_per_mil as u32, f.base_fee_msat as u32),
                )
            })
            .collect();

        let mut channels = Vec::with_capacity(channel_records.len());
        for record in &channel_records {
            let (fee_rate, base_fee_msat) =
                fees.get(record.chan_id.as_str()).copied().unwrap_or((0, 0));

            let partner_fee_rate = client
                .channel_edge(&record.chan_id)
                .await?
                .and_then(|edge| partner_fee_rate(&edge, &info.identity_pubkey));

            let partner_alias = client.node_alias(&record.remote_pubkey).await?;

            channels.push(ChannelInfo {
                id: record.chan_id.clone(),
                partner_alias,
                capacity: record.capacity,
                local_balance: record.local_balance,
                fee_rate,
                base_fee_msat,
                partner_fee_rate,
                opened_at: taken_at - Duration::seconds(record.lifetime as i64),
            });
        }

        debug!(
            "Snapshot: {} channels, {} forwards, {} payments over {} days",
            channels.len(),
            forwards.len(),
            fetched_payments.settled.len(),
            days
        );

        Ok(Self {
            node_id: info.identity_pubkey,
            alias: info.alias,
            taken_at,
            channels,
            forwards,
            payments: fetched_payments.settled,
            stale_failed_payments: fetched_payments.stale_failed,
        })
    }
}

/// The peer advertises its policy on its own side of the edge.
fn partner_fee_rate(edge: &ChannelEdge, own_id: &str) -> Option<u32> {
    let policy = if edge.node1_pub == own_id {
        edge.node2_policy.as_ref()
    } else {
        edge.node1_policy.as_ref()
    };
    policy.map(|p| p.fee_rate_milli_msat as u32)
}

async fn fetch_forwards(
    client: &(impl LndClient + Sync),
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<ForwardEvent>> {
    let mut events = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = client.forwarding_history(start, end, offset).await?;
        if page.forwarding_events.is_empty() {
            break;
        }
        for raw in &page.forwarding_events {
            events.push(ForwardEvent {
                time: time_from_ns(raw.timestamp_ns)
                    .context("forwarding event timestamp out of range")?,
                tokens: raw.amt_out,
                fee_msat: raw.fee_msat,
                in_channel: raw.chan_id_in.clone(),
                out_channel: raw.chan_id_out.clone(),
            });
        }
        if page.last_offset_index as u32 <= offset {
            break;
        }
        offset = page.last_offset_index as u32;
    }
    events.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(events)
}

struct FetchedPayments {
    settled: Vec<PaymentEvent>,
    stale_failed: Vec<String>,
}

async fn fetch_payments(
    client: &(impl LndClient + Sync),
    own_id: &str,
    window_start: DateTime<Utc>,
) -> anyhow::Result<FetchedPayments> {
    let mut settled = Vec::new();
    let mut stale_failed = Vec::new();
    let mut offset = 0u64;
    loop {
        let page = client.list_payments(offset).await?;
        if page.payments.is_empty() {
            break;
        }
        for record in &page.payments {
            let time = time_from_ns(record.creation_time_ns)
                .context("payment timestamp out of range")?;
            match record.status.as_str() {
                "SUCCEEDED" if time >= window_start => {
                    settled.push(payment_event(record, time, own_id));
                }
                "FAILED" if time < window_start => {
                    stale_failed.push(record.payment_hash.clone());
                }
                _ => {}
            }
        }
        if page.last_index_offset <= offset {
            break;
        }
        offset = page.last_index_offset;
    }
    settled.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(FetchedPayments {
        settled,
        stale_failed,
    })
}

/// Project a settled payment onto its first and last hops. A payment whose
/// final hop lands back on our own node is a rebalance between two of our
/// channels.
fn payment_event(record: &PaymentRecord, time: DateTime<Utc>, own_id: &str) -> PaymentEvent {
    let route = record
        .htlcs
        .iter()
        .find(|h| h.status == "SUCCEEDED")
        .and_then(|h| h.route.as_ref());
    let hops = route.map(|r| r.hops.as_slice()).unwrap_or(&[]);

    let out_channel = hops.first().map(|h| h.chan_id.clone());
    let last_hop = hops.last();
    let is_rebalance = last_hop.map(|h| h.pub_key == own_id).unwrap_or(false);
    let in_channel = if is_rebalance {
        last_hop.map(|h| h.chan_id.clone())
    } else {
        None
    };

    PaymentEvent {
        time,
        tokens: record.value_sat,
        fee_msat: record.fee_msat,
        out_channel,
        in_channel,
        is_rebalance,
    }
}

fn time_from_ns(ns: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp((ns / 1_000_000_000) as i64, (ns % 1_000_000_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Hop, HtlcAttempt, PaymentRecord, Route, RoutingPolicy};

    fn succeeded_payment(hops: Vec<Hop>) -> PaymentRecord {
        PaymentRecord {
            payment_hash: "hash".to_string(),
            status: "SUCCEEDED".to_string(),
            creation_time_ns: 1_700_000_000_000_000_000,
            value_sat: 50_000,
            fee_msat: 12_000,
            htlcs: vec![HtlcAttempt {
                status: "SUCCEEDED".to_string(),
                route: Some(Route { hops }),
            }],
        }
    }

    fn hop(chan_id: &str, pub_key: &str) -> Hop {
        Hop {
            chan_id: chan_id.to_string(),
            pub_key: pub_key.to_string(),
        }
    }

    #[test]
    fn test_payment_back_to_self_is_rebalance() {
        let record = succeeded_payment(vec![
            hop("ch_out", "peer_a"),
            hop("ch_mid", "peer_b"),
            hop("ch_in", "own_node"),
        ]);
        let event = payment_event(&record, Utc::now(), "own_node");
        assert!(event.is_rebalance);
        assert_eq!(event.out_channel.as_deref(), Some("ch_out"));
        assert_eq!(event.in_channel.as_deref(), Some("ch_in"));
        assert_eq!(event.tokens, 50_000);
    }

    #[test]
    fn test_payment_to_third_party_is_not_rebalance() {
        let record = succeeded_payment(vec![
            hop("ch_out", "peer_a"),
            hop("far_channel", "merchant"),
        ]);
        let event = payment_event(&record, Utc::now(), "own_node");
        assert!(!event.is_rebalance);
        assert_eq!(event.out_channel.as_deref(), Some("ch_out"));
        assert_eq!(event.in_channel, None);
    }

    #[test]
    fn test_payment_without_settled_htlc_has_no_route() {
        let mut record = succeeded_payment(vec![hop("ch_out", "peer_a")]);
        record.htlcs[0].status = "FAILED".to_string();
        let event = payment_event(&record, Utc::now(), "own_node");
        assert_eq!(event.out_channel, None);
        assert!(!event.is_rebalance);
    }

    #[test]
    fn test_partner_fee_rate_picks_remote_policy() {
        let edge = ChannelEdge {
            node1_pub: "own_node".to_string(),
            node2_pub: "peer".to_string(),
            node1_policy: Some(RoutingPolicy {
                fee_base_msat: 1000,
                fee_rate_milli_msat: 100,
                disabled: false,
            }),
            node2_policy: Some(RoutingPolicy {
                fee_base_msat: 0,
                fee_rate_milli_msat: 250,
                disabled: false,
            }),
        };
        assert_eq!(partner_fee_rate(&edge, "own_node"), Some(250));

        let flipped = ChannelEdge {
            node1_pub: "peer".to_string(),
            node2_pub: "own_node".to_string(),
            ..edge
        };
        assert_eq!(partner_fee_rate(&flipped, "own_node"), Some(100));
    }

    #[test]
    fn test_time_from_ns() {
        let time = time_from_ns(1_700_000_000_500_000_000).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert_eq!(time.timestamp_subsec_millis(), 500);
    }

    #[tokio::test]
    async fn test_collect_paginates_and_windows() {
        use crate::client::mock::MockLndClient;
        use crate::client::{ChannelRecord, ForwardingEvent};

        let now_ns = Utc::now().timestamp_nanos_opt().unwrap() as u64;
        let day_ns = 86_400_000_000_000u64;

        let mut mock = MockLndClient::new();
        mock.info.identity_pubkey = "own_node".to_string();
        mock.channels = vec![ChannelRecord {
            chan_id: "ch1".to_string(),
            remote_pubkey: "peer".to_string(),
            capacity: 1_000_000,
            local_balance: 400_000,
            remote_balance: 600_000,
            lifetime: 90 * 86_400,
            active: true,
        }];
        mock.forwards = vec![
            ForwardingEvent {
                timestamp_ns: now_ns - day_ns,
                chan_id_in: "ch0".to_string(),
                chan_id_out: "ch1".to_string(),
                amt_out: 10_000,
                fee_msat: 1_000,
            },
            ForwardingEvent {
                timestamp_ns: now_ns - 2 * day_ns,
                chan_id_in: "ch1".to_string(),
                chan_id_out: "ch0".to_string(),
                amt_out: 5_000,
                fee_msat: 500,
            },
        ];
        // An old failed payment that housekeeping should pick up.
        mock.payments = vec![PaymentRecord {
            payment_hash: "old_failure".to_string(),
            status: "FAILED".to_string(),
            creation_time_ns: now_ns - 60 * day_ns,
            ..Default::default()
        }];

        let snapshot = NodeSnapshot::collect(&mock, 30).await.unwrap();
        assert_eq!(snapshot.node_id, "own_node");
        assert_eq!(snapshot.channels.len(), 1);
        assert_eq!(snapshot.forwards.len(), 2);
        // Latest-first ordering
        assert!(snapshot.forwards[0].time > snapshot.forwards[1].time);
        assert_eq!(snapshot.stale_failed_payments, vec!["old_failure"]);
        // Channel opened ~90 days before the snapshot
        let age = snapshot.taken_at - snapshot.channels[0].opened_at;
        assert_eq!(age.num_days(), 90);
    }
}
