mod actions;
mod client;
mod config;
mod error;
mod housekeeping;
mod refresher;
mod snapshot;
mod stats;

use clap::{Parser, Subcommand};
use config::Config;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use crate::client::{LndClient, LndRestClient};
use crate::refresher::Refresher;

#[derive(Parser)]
#[command(name = "lnd-advisor", about = "Balance and fee advisor for LND routing nodes")]
struct Cli {
    /// Path to lnd-advisor.toml config file
    #[arg(short, long, default_value = "lnd-advisor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the node and emit recommendations on every change (default)
    Daemon,
    /// Produce one batch of recommendations and exit
    RunOnce,
    /// Print a summary of the node and its channels
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(
            config
                .general
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .format_timestamp_secs()
        .init();

    info!("lnd-advisor v{} starting", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(config);
    let client = Arc::new(LndRestClient::new(&config)?);

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => run_daemon(config, client).await,
        Commands::RunOnce => run_once(config, client).await,
        Commands::Info => print_info(client).await,
    }
}

async fn run_daemon(config: Arc<Config>, client: Arc<LndRestClient>) -> anyhow::Result<()> {
    // Startup connectivity check
    info!("Verifying LND connectivity...");
    match client.get_info().await {
        Ok(node) => info!("Connected to {} ({})", node.alias, node.identity_pubkey),
        Err(e) => {
            error!("Cannot reach LND: {:#}. Aborting.", e);
            return Err(e);
        }
    }

    let watcher = Refresher::new(Arc::clone(&client), Arc::clone(&config));

    // First advisory pass before any event arrives.
    if let Err(e) = watcher.refresh().await {
        error!("Initial refresh failed: {:#}", e);
    }

    // Shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("Received shutdown signal, finishing current refresh...");
        let _ = shutdown_tx.send(true);
    });

    for path in [
        client::CHANNEL_EVENTS_PATH,
        client::HTLC_EVENTS_PATH,
        client::PAYMENT_EVENTS_PATH,
    ] {
        let watcher = Arc::clone(&watcher);
        client.spawn_event_stream(path, shutdown_rx.clone(), move || watcher.nudge());
    }

    info!(
        "Watching channel, forward and payment events (debounce: {}s)",
        config.general.refresh_debounce_secs
    );

    let _ = shutdown_rx.changed().await;
    // A refresh that is already underway still gets emitted.
    watcher.drain().await;
    info!("Shutting down gracefully");
    Ok(())
}

async fn run_once(config: Arc<Config>, client: Arc<LndRestClient>) -> anyhow::Result<()> {
    info!("Running single advisory pass...");
    let actions = refresher::advise(client.as_ref(), &config).await?;
    refresher::emit(&actions)?;
    info!("Emitted {} actions", actions.len());
    Ok(())
}

async fn print_info(client: Arc<LndRestClient>) -> anyhow::Result<()> {
    let node = client.get_info().await?;
    let channels = client.list_channels().await?;

    let capacity: u64 = channels.iter().map(|c| c.capacity).sum();
    let local: u64 = channels.iter().map(|c| c.local_balance).sum();
    let active = channels.iter().filter(|c| c.active).count();

    println!("lnd-advisor");
    println!("===========");
    println!("Node:            {} ({})", node.alias, node.identity_pubkey);
    println!("Channels:        {} ({} active)", channels.len(), active);
    println!("Total capacity:  {} sat", capacity);
    println!("Local balance:   {} sat", local);

    Ok(())
}

#[cfg(test)]
mod integration_tests {
    use crate::actions::{Entity, Variable};
    use crate::client::mock::MockLndClient;
    use crate::client::{ChannelFeeReport, ChannelRecord, ForwardingEvent, PaymentRecord};
    use crate::config::Config;
    use crate::refresher::advise;
    use chrono::Utc;

    fn test_config() -> Config {
        Config::test_default(std::path::PathBuf::from("/dev/null"))
    }

    fn make_channel(id: &str, peer: &str, capacity: u64, local_balance: u64) -> ChannelRecord {
        ChannelRecord {
            chan_id: id.to_string(),
            remote_pubkey: peer.to_string(),
            capacity,
            local_balance,
            remote_balance: capacity - local_balance,
            lifetime: 90 * 86_400,
            active: true,
        }
    }

    fn make_fee_report(id: &str, ppm: u64) -> ChannelFeeReport {
        ChannelFeeReport {
            chan_id: id.to_string(),
            base_fee_msat: 0,
            fee_per_mil: ppm,
        }
    }

    fn now_ns() -> u64 {
        Utc::now().timestamp_nanos_opt().unwrap() as u64
    }

    // -----------------------------------------------------------------------
    // Test 1: Empty node produces no actions
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_advise_empty_node() {
        let mock = MockLndClient::new();
        let config = test_config();
        let actions = advise(&mock, &config).await.unwrap();
        assert!(actions.is_empty());
    }

    // -----------------------------------------------------------------------
    // Test 2: Skewed channels produce the full ordered batch
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_advise_orders_balance_node_fees() {
        let mut mock = MockLndClient::new();
        mock.channels = vec![
            // Depleted channel: balance action + fee action at the cap.
            make_channel("ch_a", "peer_a", 1_000_000, 50_000),
            // Overfull channel: balance action + fee action at zero.
            make_channel("ch_b", "peer_b", 1_000_000, 700_000),
        ];
        mock.channel_fees = vec![make_fee_report("ch_a", 100), make_fee_report("ch_b", 100)];
        mock.aliases
            .insert("peer_a".to_string(), "Alice".to_string());

        let config = test_config();
        let actions = advise(&mock, &config).await.unwrap();

        // Every emitted action has a nonzero priority.
        assert!(actions.iter().all(|a| a.priority >= 1));

        // Channel balance actions precede the node action, fees come last.
        let kinds: Vec<(Entity, Variable)> =
            actions.iter().map(|a| (a.entity, a.variable)).collect();
        assert_eq!(
            kinds,
            vec![
                (Entity::Channel, Variable::Balance),
                (Entity::Channel, Variable::Balance),
                (Entity::Node, Variable::Balance),
                (Entity::Channel, Variable::FeeRate),
                (Entity::Channel, Variable::FeeRate),
            ]
        );

        // The depleted channel is priced at the cap, the overfull one at 0.
        let fee_a = actions
            .iter()
            .find(|a| a.variable == Variable::FeeRate && a.id.as_deref() == Some("ch_a"))
            .unwrap();
        let fee_b = actions
            .iter()
            .find(|a| a.variable == Variable::FeeRate && a.id.as_deref() == Some("ch_b"))
            .unwrap();
        assert_eq!(fee_a.target, config.actions.max_fee_rate as i64);
        assert_eq!(fee_b.target, 0);

        // The partner alias flows through to the action.
        assert_eq!(fee_a.alias.as_deref(), Some("Alice"));

        // Fee targets stay within [0, max_fee_rate].
        for action in actions.iter().filter(|a| a.variable == Variable::FeeRate) {
            assert!(action.target >= 0 && action.target <= config.actions.max_fee_rate as i64);
        }
    }

    // -----------------------------------------------------------------------
    // Test 3: A busy balanced channel stays quiet
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_advise_balanced_active_channel_is_quiet() {
        let mut mock = MockLndClient::new();
        mock.channels = vec![make_channel("ch_a", "peer_a", 1_000_000, 500_000)];
        mock.channel_fees = vec![make_fee_report("ch_a", 100)];

        // Balanced two-way flow, recent enough that no decrease is due.
        let hour_ns = 3_600_000_000_000u64;
        for i in 0..12u64 {
            mock.forwards.push(ForwardingEvent {
                timestamp_ns: now_ns() - i * hour_ns,
                chan_id_in: "ch_other".to_string(),
                chan_id_out: "ch_a".to_string(),
                amt_out: 20_000,
                fee_msat: 2_000,
            });
            mock.forwards.push(ForwardingEvent {
                timestamp_ns: now_ns() - i * hour_ns - hour_ns / 2,
                chan_id_in: "ch_a".to_string(),
                chan_id_out: "ch_other".to_string(),
                amt_out: 20_000,
                fee_msat: 2_000,
            });
        }

        let config = test_config();
        let actions = advise(&mock, &config).await.unwrap();
        assert!(
            actions.is_empty(),
            "balanced channel should need nothing, got {:?}",
            actions
        );
    }

    // -----------------------------------------------------------------------
    // Test 4: Stale failed payments are purged
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_advise_purges_stale_failed_payments() {
        let day_ns = 86_400_000_000_000u64;
        let mut mock = MockLndClient::new();
        mock.payments = vec![
            PaymentRecord {
                payment_hash: "old_failure".to_string(),
                status: "FAILED".to_string(),
                creation_time_ns: now_ns() - 45 * day_ns,
                ..Default::default()
            },
            // Recent failure stays.
            PaymentRecord {
                payment_hash: "fresh_failure".to_string(),
                status: "FAILED".to_string(),
                creation_time_ns: now_ns() - day_ns,
                ..Default::default()
            },
        ];

        let config = test_config();
        advise(&mock, &config).await.unwrap();

        let calls = mock.delete_payment_calls.lock().unwrap();
        assert_eq!(*calls, vec!["old_failure"]);
    }

    // -----------------------------------------------------------------------
    // Test 5: Actions survive a JSON round trip
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_advise_actions_round_trip_as_json() {
        let mut mock = MockLndClient::new();
        mock.channels = vec![make_channel("ch_a", "peer_a", 1_000_000, 50_000)];
        mock.channel_fees = vec![make_fee_report("ch_a", 100)];

        let config = test_config();
        let actions = advise(&mock, &config).await.unwrap();
        assert!(!actions.is_empty());

        for action in &actions {
            let json = serde_json::to_string(action).unwrap();
            let parsed: crate::actions::Action = serde_json::from_str(&json).unwrap();
            assert_eq!(&parsed, action);
        }
    }
}
