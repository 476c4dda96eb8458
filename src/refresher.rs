use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::actions::{Action, ActionsEngine};
use crate::client::LndClient;
use crate::config::Config;
use crate::housekeeping;
use crate::snapshot::NodeSnapshot;
use crate::stats::NodeStats;

/// One full advisory pass: snapshot, statistics, engine, housekeeping.
pub async fn advise(
    client: &(impl LndClient + Sync),
    config: &Config,
) -> anyhow::Result<Vec<Action>> {
    let snapshot = NodeSnapshot::collect(client, config.actions.days).await?;
    let stats = NodeStats::build(&snapshot, config.actions.days)?;
    let engine = ActionsEngine::new(&config.actions, &stats, snapshot.taken_at)?;
    let actions = engine.get()?;
    housekeeping::purge_failed_payments(client, &snapshot.stale_failed_payments).await;
    Ok(actions)
}

/// Print each action as one JSON line and summarize it in the log.
pub fn emit(actions: &[Action]) -> anyhow::Result<()> {
    for action in actions {
        println!("{}", serde_json::to_string(action)?);
        info!(
            "Action (priority {}): {} {:?} {} -> {} -- {}",
            action.priority,
            action.id.as_deref().unwrap_or("node"),
            action.variable,
            action.actual,
            action.target,
            action.reason,
        );
    }
    if actions.is_empty() {
        info!("No actions recommended");
    }
    Ok(())
}

/// Debounced refresh scheduler.
///
/// Node subscriptions call `nudge()` on every event. The first nudge
/// schedules a refresh after the configured delay; nudges arriving while
/// one is pending or running are dropped, so a burst of events costs one
/// refresh. The busy flag resets when the refresh finishes, successfully
/// or not.
pub struct Refresher<C: LndClient + 'static> {
    client: Arc<C>,
    config: Arc<Config>,
    busy: AtomicBool,
}

impl<C: LndClient + 'static> Refresher<C> {
    pub fn new(client: Arc<C>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            busy: AtomicBool::new(false),
        })
    }

    pub fn nudge(self: &Arc<Self>) {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Refresher: busy, dropping change event");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            sleep(Duration::from_secs(this.config.general.refresh_debounce_secs)).await;
            if let Err(e) = this.refresh().await {
                error!("Refresh failed: {:#}", e);
            }
            this.busy.store(false, Ordering::SeqCst);
        });
    }

    /// Run a refresh immediately, bypassing the debounce delay.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let actions = advise(self.client.as_ref(), &self.config).await?;
        emit(&actions)?;
        Ok(())
    }

    /// Wait until no refresh is pending or running. Used at shutdown so a
    /// batch that is already underway is emitted rather than cut off.
    pub async fn drain(&self) {
        while self.busy.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(100)).await;
        }
    }
}
