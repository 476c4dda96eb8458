use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::snapshot::{ChannelInfo, ForwardEvent, PaymentEvent};

/// One balance-affecting event on a channel.
///
/// `amount` is the satoshi delta the event removed from the local balance,
/// so debits (out-forwards, out-rebalances, payments) are positive and
/// credits (in-forwards, in-rebalances) are negative. `balance` is the
/// local balance immediately after the event. Walking a latest-first
/// history with `balance + amount` reproduces each prior balance.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    InForward {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
        out_channel: Option<String>,
    },
    OutForward {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
        in_channel: Option<String>,
    },
    InRebalance {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
    OutRebalance {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
    OutPayment {
        time: DateTime<Utc>,
        amount: i64,
        fee_msat: u64,
        balance: u64,
    },
}

impl Change {
    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Change::InForward { time, .. }
            | Change::OutForward { time, .. }
            | Change::InRebalance { time, .. }
            | Change::OutRebalance { time, .. }
            | Change::OutPayment { time, .. } => *time,
        }
    }

    pub fn amount(&self) -> i64 {
        match self {
            Change::InForward { amount, .. }
            | Change::OutForward { amount, .. }
            | Change::InRebalance { amount, .. }
            | Change::OutRebalance { amount, .. }
            | Change::OutPayment { amount, .. } => *amount,
        }
    }

    pub fn fee_msat(&self) -> u64 {
        match self {
            Change::InForward { fee_msat, .. }
            | Change::OutForward { fee_msat, .. }
            | Change::InRebalance { fee_msat, .. }
            | Change::OutRebalance { fee_msat, .. }
            | Change::OutPayment { fee_msat, .. } => *fee_msat,
        }
    }

    pub fn balance(&self) -> u64 {
        match self {
            Change::InForward { balance, .. }
            | Change::OutForward { balance, .. }
            | Change::InRebalance { balance, .. }
            | Change::OutRebalance { balance, .. }
            | Change::OutPayment { balance, .. } => *balance,
        }
    }

    fn set_balance(&mut self, value: u64) {
        match self {
            Change::InForward { balance, .. }
            | Change::OutForward { balance, .. }
            | Change::InRebalance { balance, .. }
            | Change::OutRebalance { balance, .. }
            | Change::OutPayment { balance, .. } => *balance = value,
        }
    }

    pub fn is_out_forward(&self) -> bool {
        matches!(self, Change::OutForward { .. })
    }

    pub fn is_in_rebalance(&self) -> bool {
        matches!(self, Change::InRebalance { .. })
    }
}

fn non_empty(id: &str) -> Option<String> {
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Build one channel's latest-first change history from the node-wide event
/// lists, back-propagating balances from the current local balance.
///
/// The inbound side of a forward carries the routing fee, so an in-forward
/// credits `tokens + fee`; the outbound side debits `tokens`. A rebalance
/// debits `tokens + fee` on its source channel and credits `tokens` on its
/// destination.
pub fn build_history(
    channel: &ChannelInfo,
    forwards: &[ForwardEvent],
    payments: &[PaymentEvent],
) -> Result<Vec<Change>, EngineError> {
    let mut history: Vec<Change> = Vec::new();

    for forward in forwards {
        let fee_sat = (forward.fee_msat / 1000) as i64;
        if forward.out_channel == channel.id {
            history.push(Change::OutForward {
                time: forward.time,
                amount: forward.tokens as i64,
                fee_msat: forward.fee_msat,
                balance: 0,
                in_channel: non_empty(&forward.in_channel),
            });
        }
        if forward.in_channel == channel.id {
            history.push(Change::InForward {
                time: forward.time,
                amount: -(forward.tokens as i64 + fee_sat),
                fee_msat: forward.fee_msat,
                balance: 0,
                out_channel: non_empty(&forward.out_channel),
            });
        }
    }

    for payment in payments {
        let fee_sat = (payment.fee_msat / 1000) as i64;
        if payment.is_rebalance {
            if payment.out_channel.as_deref() == Some(channel.id.as_str()) {
                history.push(Change::OutRebalance {
                    time: payment.time,
                    amount: payment.tokens as i64 + fee_sat,
                    fee_msat: payment.fee_msat,
                    balance: 0,
                });
            }
            if payment.in_channel.as_deref() == Some(channel.id.as_str()) {
                history.push(Change::InRebalance {
                    time: payment.time,
                    amount: -(payment.tokens as i64),
                    fee_msat: payment.fee_msat,
                    balance: 0,
                });
            }
        } else if payment.out_channel.as_deref() == Some(channel.id.as_str()) {
            history.push(Change::OutPayment {
                time: payment.time,
                amount: payment.tokens as i64 + fee_sat,
                fee_msat: payment.fee_msat,
                balance: 0,
            });
        }
    }

    history.sort_by(|a, b| b.time().cmp(&a.time()));

    let mut running = channel.local_balance as i64;
    for change in &mut history {
        if running < 0 || running > channel.capacity as i64 {
            return Err(EngineError::SnapshotInvariant(format!(
                "channel {}: balance {} outside [0, {}] at {}",
                channel.id,
                running,
                channel.capacity,
                change.time()
            )));
        }
        change.set_balance(running as u64);
        running += change.amount();
    }
    // The reconstructed balance before the oldest event is a balance the
    // channel once held; it must fit as well.
    if running < 0 || running > channel.capacity as i64 {
        return Err(EngineError::SnapshotInvariant(format!(
            "channel {}: balance {} before the oldest event outside [0, {}]",
            channel.id, running, channel.capacity
        )));
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn channel(local_balance: u64) -> ChannelInfo {
        ChannelInfo {
            id: "ch1".to_string(),
            partner_alias: None,
            capacity: 1_000_000,
            local_balance,
            fee_rate: 100,
            base_fee_msat: 1000,
            partner_fee_rate: None,
            opened_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0).unwrap()
    }

    fn forward(hour: u32, tokens: u64, fee_msat: u64, incoming: &str, outgoing: &str) -> ForwardEvent {
        ForwardEvent {
            time: at(hour),
            tokens,
            fee_msat,
            in_channel: incoming.to_string(),
            out_channel: outgoing.to_string(),
        }
    }

    #[test]
    fn test_history_is_latest_first() {
        let forwards = vec![
            forward(1, 10_000, 1_000, "ch0", "ch1"),
            forward(5, 20_000, 2_000, "ch0", "ch1"),
            forward(3, 30_000, 3_000, "ch1", "ch0"),
        ];
        let history = build_history(&channel(500_000), &forwards, &[]).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].time(), at(5));
        assert_eq!(history[1].time(), at(3));
        assert_eq!(history[2].time(), at(1));
    }

    #[test]
    fn test_balances_back_propagate() {
        // Newest first: out-forward of 20k, then in-forward of 30k (+3 sat fee).
        let forwards = vec![
            forward(5, 20_000, 2_000, "ch0", "ch1"),
            forward(3, 30_000, 3_000, "ch1", "ch0"),
        ];
        let history = build_history(&channel(500_000), &forwards, &[]).unwrap();
        // Balance after the newest event is the current balance.
        assert_eq!(history[0].balance(), 500_000);
        assert_eq!(history[0].amount(), 20_000);
        // Before the out-forward we held 520_000, which is the balance
        // after the in-forward.
        assert_eq!(history[1].balance(), 520_000);
        // The in-forward credited tokens + fee.
        assert_eq!(history[1].amount(), -30_003);
    }

    #[test]
    fn test_rebalance_splits_into_both_legs() {
        let payment = PaymentEvent {
            time: at(4),
            tokens: 50_000,
            fee_msat: 25_000,
            out_channel: Some("ch1".to_string()),
            in_channel: Some("ch2".to_string()),
            is_rebalance: true,
        };

        let source = build_history(&channel(500_000), &[], &[payment.clone()]).unwrap();
        assert_eq!(source.len(), 1);
        assert!(matches!(source[0], Change::OutRebalance { .. }));
        assert_eq!(source[0].amount(), 50_025);

        let mut destination_props = channel(500_000);
        destination_props.id = "ch2".to_string();
        let destination = build_history(&destination_props, &[], &[payment]).unwrap();
        assert_eq!(destination.len(), 1);
        assert!(matches!(destination[0], Change::InRebalance { .. }));
        assert_eq!(destination[0].amount(), -50_000);
    }

    #[test]
    fn test_external_payment_is_out_payment() {
        let payment = PaymentEvent {
            time: at(4),
            tokens: 10_000,
            fee_msat: 5_000,
            out_channel: Some("ch1".to_string()),
            in_channel: None,
            is_rebalance: false,
        };
        let history = build_history(&channel(500_000), &[], &[payment]).unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(history[0], Change::OutPayment { .. }));
        assert_eq!(history[0].amount(), 10_005);
    }

    #[test]
    fn test_unrelated_events_are_ignored() {
        let forwards = vec![forward(2, 10_000, 1_000, "ch5", "ch6")];
        let history = build_history(&channel(500_000), &forwards, &[]).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_balance_out_of_range_is_rejected() {
        // An out-forward of 900k implies a past balance of 1.4M on a 1M
        // capacity channel.
        let forwards = vec![forward(5, 900_000, 1_000, "ch0", "ch1")];
        let err = build_history(&channel(500_000), &forwards, &[]).unwrap_err();
        assert!(matches!(err, EngineError::SnapshotInvariant(_)));
        assert!(err.to_string().contains("ch1"));
    }

    #[test]
    fn test_forward_through_same_channel_both_sides() {
        // A forward can enter and leave on different channels only, but the
        // builder must tolerate seeing the channel on either side of
        // separate events at the same timestamp.
        let forwards = vec![
            forward(5, 10_000, 1_000, "ch0", "ch1"),
            forward(5, 10_000, 1_000, "ch1", "ch2"),
        ];
        let history = build_history(&channel(500_000), &forwards, &[]).unwrap();
        assert_eq!(history.len(), 2);
    }
}
