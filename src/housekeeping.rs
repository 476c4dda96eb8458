use log::{info, warn};

use crate::client::LndClient;

/// Delete failed payments that aged out of the window. Best effort: a
/// deletion failure is logged and the payment retried on the next refresh.
pub async fn purge_failed_payments(client: &(impl LndClient + Sync), stale: &[String]) {
    if stale.is_empty() {
        return;
    }
    let mut deleted = 0usize;
    for payment_hash in stale {
        match client.delete_payment(payment_hash).await {
            Ok(()) => deleted += 1,
            Err(e) => warn!(
                "Housekeeping: could not delete failed payment {}: {:#}",
                payment_hash, e
            ),
        }
    }
    info!(
        "Housekeeping: deleted {} of {} stale failed payments",
        deleted,
        stale.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockLndClient;

    #[tokio::test]
    async fn test_purges_each_stale_payment() {
        let client = MockLndClient::new();
        let stale = vec!["aaa".to_string(), "bbb".to_string()];
        purge_failed_payments(&client, &stale).await;
        let calls = client.delete_payment_calls.lock().unwrap();
        assert_eq!(*calls, vec!["aaa", "bbb"]);
    }

    #[tokio::test]
    async fn test_no_stale_payments_no_calls() {
        let client = MockLndClient::new();
        purge_failed_payments(&client, &[]).await;
        assert!(client.delete_payment_calls.lock().unwrap().is_empty());
    }
}
