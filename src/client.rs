use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::sleep;

use crate::config::Config;

/// Trait abstracting the LND REST surface used by the advisor.
///
/// This enables mock-based integration testing without a live node.
#[async_trait]
pub trait LndClient: Send + Sync {
    async fn get_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelRecord>>;
    async fn fee_report(&self) -> anyhow::Result<Vec<ChannelFeeReport>>;
    async fn channel_edge(&self, chan_id: &str) -> anyhow::Result<Option<ChannelEdge>>;
    async fn node_alias(&self, pub_key: &str) -> anyhow::Result<Option<String>>;
    async fn forwarding_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index_offset: u32,
    ) -> anyhow::Result<ForwardingHistoryResponse>;
    async fn list_payments(&self, index_offset: u64) -> anyhow::Result<ListPaymentsResponse>;
    async fn delete_payment(&self, payment_hash: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------
// LND's REST gateway encodes 64-bit integers as JSON strings; the
// `number_from_string` helper accepts either form.

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeInfo {
    pub identity_pubkey: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChannelRecord {
    #[serde(default)]
    pub chan_id: String,
    #[serde(default)]
    pub remote_pubkey: String,
    #[serde(deserialize_with = "number_from_string", default)]
    pub capacity: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub local_balance: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub remote_balance: u64,
    /// Seconds this channel has been observed open.
    #[serde(deserialize_with = "number_from_string", default)]
    pub lifetime: u64,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListChannelsResponse {
    #[serde(default)]
    pub channels: Vec<ChannelRecord>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChannelFeeReport {
    #[serde(default)]
    pub chan_id: String,
    #[serde(deserialize_with = "number_from_string", default)]
    pub base_fee_msat: u64,
    /// Proportional fee in parts per million.
    #[serde(deserialize_with = "number_from_string", default)]
    pub fee_per_mil: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeeReportResponse {
    #[serde(default)]
    pub channel_fees: Vec<ChannelFeeReport>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingPolicy {
    #[serde(deserialize_with = "number_from_string", default)]
    pub fee_base_msat: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub fee_rate_milli_msat: u64,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChannelEdge {
    #[serde(default)]
    pub node1_pub: String,
    #[serde(default)]
    pub node2_pub: String,
    pub node1_policy: Option<RoutingPolicy>,
    pub node2_policy: Option<RoutingPolicy>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct GraphNodeResponse {
    node: Option<GraphNode>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct GraphNode {
    #[serde(default)]
    alias: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForwardingEvent {
    #[serde(deserialize_with = "number_from_string", default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub chan_id_in: String,
    #[serde(default)]
    pub chan_id_out: String,
    #[serde(deserialize_with = "number_from_string", default)]
    pub amt_out: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub fee_msat: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ForwardingHistoryResponse {
    #[serde(default)]
    pub forwarding_events: Vec<ForwardingEvent>,
    #[serde(deserialize_with = "number_from_string", default)]
    pub last_offset_index: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PaymentRecord {
    #[serde(default)]
    pub payment_hash: String,
    /// "SUCCEEDED", "FAILED" or "IN_FLIGHT".
    #[serde(default)]
    pub status: String,
    #[serde(deserialize_with = "number_from_string", default)]
    pub creation_time_ns: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub value_sat: u64,
    #[serde(deserialize_with = "number_from_string", default)]
    pub fee_msat: u64,
    #[serde(default)]
    pub htlcs: Vec<HtlcAttempt>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HtlcAttempt {
    #[serde(default)]
    pub status: String,
    pub route: Option<Route>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Route {
    #[serde(default)]
    pub hops: Vec<Hop>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Hop {
    #[serde(default)]
    pub chan_id: String,
    #[serde(default)]
    pub pub_key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListPaymentsResponse {
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
    #[serde(deserialize_with = "number_from_string", default)]
    pub last_index_offset: u64,
}

fn number_from_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct NumberVisitor;

    impl<'de> serde::de::Visitor<'de> for NumberVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("an unsigned integer or its decimal string form")
        }

        fn visit_u64<E>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("negative value"))
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(NumberVisitor)
}

// ---------------------------------------------------------------------------
// REST client
// ---------------------------------------------------------------------------

/// Rate-limited, retrying client for the LND REST gateway.
pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
    /// Semaphore for rate limiting (1 concurrent request)
    rate_limiter: Arc<Semaphore>,
    stream_backoff: Duration,
}

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 100;
const FORWARDS_PAGE_SIZE: u32 = 1000;
const PAYMENTS_PAGE_SIZE: u64 = 1000;

/// Streaming endpoints consumed only as "something changed" signals.
pub const CHANNEL_EVENTS_PATH: &str = "/v1/channels/subscribe";
pub const HTLC_EVENTS_PATH: &str = "/v2/router/htlcevents";
pub const PAYMENT_EVENTS_PATH: &str = "/v2/router/payments";

impl LndRestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(&config.node.tls_cert_path).with_context(|| {
            format!(
                "Failed to read TLS cert at {}",
                config.node.tls_cert_path.display()
            )
        })?;
        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .context("TLS cert is not valid PEM")?;

        let macaroon = std::fs::read(&config.node.macaroon_path).with_context(|| {
            format!(
                "Failed to read macaroon at {}",
                config.node.macaroon_path.display()
            )
        })?;

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.node.rest_url.trim_end_matches('/').to_string(),
            macaroon_hex: hex::encode(macaroon),
            rate_limiter: Arc::new(Semaphore::new(1)),
            stream_backoff: Duration::from_secs(config.general.retry_backoff_secs),
        })
    }

    async fn rate_limit(&self) -> anyhow::Result<()> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
        sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
        Ok(())
    }

    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        for attempt in 0..MAX_RETRIES {
            self.rate_limit().await?;
            match f().await {
                Ok(resp) => {
                    debug!("{}: success", name);
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                        warn!(
                            "{}: attempt {} failed ({:#}), retrying in {}ms",
                            name,
                            attempt + 1,
                            e,
                            delay
                        );
                        sleep(Duration::from_millis(delay)).await;
                    } else {
                        return Err(anyhow::anyhow!(
                            "{}: all {} attempts failed: {:#}",
                            name,
                            MAX_RETRIES,
                            e
                        ));
                    }
                }
            }
        }
        unreachable!()
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .post(&url)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Keep a streaming endpoint open, invoking `on_event` for every
    /// received chunk. Content is irrelevant; a chunk only means the node
    /// state moved. Reconnects after a fixed backoff on error or EOF, and
    /// stops when the shutdown signal flips.
    pub fn spawn_event_stream(
        self: &Arc<Self>,
        path: &'static str,
        mut shutdown: watch::Receiver<bool>,
        on_event: impl Fn() + Send + Sync + 'static,
    ) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    result = client.stream_once(path, &on_event) => match result {
                        Ok(()) => warn!("{}: event stream ended, reconnecting", path),
                        Err(e) => warn!("{}: event stream error: {:#}, reconnecting", path, e),
                    },
                    _ = shutdown.changed() => break,
                }
                tokio::select! {
                    _ = sleep(client.stream_backoff) => {},
                    _ = shutdown.changed() => break,
                }
            }
            debug!("{}: event stream stopped", path);
        });
    }

    async fn stream_once(
        &self,
        path: &str,
        on_event: &(impl Fn() + Send + Sync),
    ) -> anyhow::Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await?
            .error_for_status()?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let _ = chunk?;
            on_event();
        }
        Ok(())
    }
}

#[async_trait]
impl LndClient for LndRestClient {
    async fn get_info(&self) -> anyhow::Result<NodeInfo> {
        self.with_retry("GetInfo", || self.get_json("/v1/getinfo")).await
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelRecord>> {
        let resp: ListChannelsResponse = self
            .with_retry("ListChannels", || self.get_json("/v1/channels"))
            .await?;
        Ok(resp.channels)
    }

    async fn fee_report(&self) -> anyhow::Result<Vec<ChannelFeeReport>> {
        let resp: FeeReportResponse = self
            .with_retry("FeeReport", || self.get_json("/v1/fees"))
            .await?;
        Ok(resp.channel_fees)
    }

    async fn channel_edge(&self, chan_id: &str) -> anyhow::Result<Option<ChannelEdge>> {
        let path = format!("/v1/graph/edge/{}", chan_id);
        // An unannounced channel has no graph edge; that is not an error.
        match self.with_retry("ChannelEdge", || self.get_json(&path)).await {
            Ok(edge) => Ok(Some(edge)),
            Err(e) => {
                debug!("ChannelEdge {}: {:#}", chan_id, e);
                Ok(None)
            }
        }
    }

    async fn node_alias(&self, pub_key: &str) -> anyhow::Result<Option<String>> {
        let path = format!("/v1/graph/node/{}", pub_key);
        match self.with_retry("NodeAlias", || self.get_json::<GraphNodeResponse>(&path)).await {
            Ok(resp) => Ok(resp.node.map(|n| n.alias).filter(|a| !a.is_empty())),
            Err(e) => {
                debug!("NodeAlias {}: {:#}", pub_key, e);
                Ok(None)
            }
        }
    }

    async fn forwarding_history(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        index_offset: u32,
    ) -> anyhow::Result<ForwardingHistoryResponse> {
        #[derive(serde::Serialize)]
        struct Request {
            start_time: String,
            end_time: String,
            index_offset: u32,
            num_max_events: u32,
        }
        let body = Request {
            start_time: start.timestamp().to_string(),
            end_time: end.timestamp().to_string(),
            index_offset,
            num_max_events: FORWARDS_PAGE_SIZE,
        };
        self.with_retry("ForwardingHistory", || self.post_json("/v1/switch", &body))
            .await
    }

    async fn list_payments(&self, index_offset: u64) -> anyhow::Result<ListPaymentsResponse> {
        let path = format!(
            "/v1/payments?include_incomplete=true&index_offset={}&max_payments={}",
            index_offset, PAYMENTS_PAGE_SIZE
        );
        self.with_retry("ListPayments", || self.get_json(&path)).await
    }

    async fn delete_payment(&self, payment_hash: &str) -> anyhow::Result<()> {
        let path = format!(
            "/v1/payment?payment_hash={}&failed_htlcs_only=false",
            payment_hash
        );
        let url = format!("{}{}", self.base_url, path);
        self.with_retry("DeletePayment", || async {
            self.http
                .delete(&url)
                .header(MACAROON_HEADER, &self.macaroon_hex)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------
