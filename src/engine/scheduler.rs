// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic cycle drivers.
//!
//! One supervisor scans the configuration boundary every `scan_interval` and
//! spawns a scheduler for each config id it has no live scheduler for. The
//! same scan purges ledger rows owned by configs that no longer exist (and
//! whose scheduler has exited). Each scheduler owns one config:
//!
//! ```text
//! tick ──→ re-read config ──vanished──→ exit
//!              │
//!              ├── suspended ──→ Suspended, skip
//!              ├── remote-managed site ──→ skip
//!              ├── period changed ──→ reset ticker
//!              ↓
//!         run_cycle (serialized with sync_now)
//! ```

use super::reconcile::Reconciler;
use super::types::CycleState;
use crate::config::ReplicatorConfig;
use crate::config_store::ConfigStore;
use crate::ledger::ItemLedger;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Shared per-config cycle state.
#[derive(Debug)]
pub(crate) struct CycleSlot {
    state: watch::Sender<CycleState>,
    cancel: AtomicBool,
    /// Held for the duration of a cycle; one cycle per config at a time.
    running: tokio::sync::Mutex<()>,
}

impl CycleSlot {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            state,
            cancel: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: CycleState) {
        self.state.send_replace(state);
    }

    /// True while a cycle is querying or processing.
    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state(), CycleState::Querying | CycleState::Processing)
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.running.lock().await
    }
}

pub(crate) type Slots = Arc<DashMap<String, Arc<CycleSlot>>>;

/// Get or create the slot for a config.
pub(crate) fn slot_for(slots: &Slots, config_id: &str) -> Arc<CycleSlot> {
    slots
        .entry(config_id.to_string())
        .or_insert_with(|| Arc::new(CycleSlot::new()))
        .clone()
}

/// Scheduler tasks by config id.
pub(crate) type Schedulers = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// True if either end of the config is driven by another node.
fn is_remote_managed(configs: &dyn ConfigStore, config: &ReplicatorConfig) -> bool {
    [&config.source, &config.destination]
        .into_iter()
        .filter_map(|id| configs.site(id))
        .any(|site| site.remote_managed)
}

/// Run the supervisor until shutdown.
pub(crate) async fn run_supervisor(
    reconciler: Arc<Reconciler>,
    slots: Slots,
    schedulers: Schedulers,
    scan_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("supervisor");

    async move {
        let _ = shutdown_rx.borrow_and_update();
        info!(scan_interval_ms = scan_interval.as_millis() as u64, "Starting config supervisor");

        let mut timer = tokio::time::interval(scan_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping supervisor");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let live = scan(&reconciler, &slots, &schedulers, &shutdown_rx);
            purge_orphans(reconciler.ledger().as_ref(), &live).await;
        }
    }
    .instrument(span)
    .await
}

/// Spawn schedulers for configs that have none (or whose scheduler exited).
/// Returns every config id that exists or still has a running scheduler.
fn scan(
    reconciler: &Arc<Reconciler>,
    slots: &Slots,
    schedulers: &Schedulers,
    shutdown_rx: &watch::Receiver<bool>,
) -> HashSet<String> {
    let configs = reconciler.configs().configs();
    let mut guard = schedulers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.retain(|_, handle| !handle.is_finished());
    let mut live: HashSet<String> = guard.keys().cloned().collect();

    for config in configs {
        live.insert(config.id.clone());
        if guard.contains_key(&config.id) {
            continue;
        }
        let slot = slot_for(slots, &config.id);
        let reconciler = Arc::clone(reconciler);
        let shutdown_rx = shutdown_rx.clone();
        let config_id = config.id.clone();

        debug!(config_id = %config_id, "Spawning scheduler");
        let handle = tokio::spawn(run_scheduler(config_id, reconciler, slot, shutdown_rx));
        guard.insert(config.id, handle);
    }
    live
}

/// Delete ledger rows of configs outside `live`. Anything that fails is
/// picked up again by the next scan.
async fn purge_orphans(ledger: &dyn ItemLedger, live: &HashSet<String>) {
    let owners = match ledger.config_ids().await {
        Ok(owners) => owners,
        Err(e) => {
            warn!(error = %e, "Failed to list ledger owners, purge deferred");
            return;
        }
    };

    for config_id in owners.iter().filter(|id| !live.contains(*id)) {
        match ledger.delete_for_config(config_id).await {
            Ok(rows) => info!(config_id = %config_id, rows, "Purged ledger rows of deleted config"),
            Err(e) => warn!(config_id = %config_id, error = %e, "Failed to purge ledger rows, retrying next scan"),
        }
    }
}

/// Drive one config's cycles until shutdown or until the config vanishes.
pub(crate) async fn run_scheduler(
    config_id: String,
    reconciler: Arc<Reconciler>,
    slot: Arc<CycleSlot>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("scheduler", config_id = %config_id);

    async move {
        let _ = shutdown_rx.borrow_and_update();
        let configs = Arc::clone(reconciler.configs());

        let Some(config) = configs.config(&config_id) else {
            warn!("Config not found, scheduler not started");
            return;
        };
        let mut period = config.period_duration();
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                    continue;
                }

                _ = timer.tick() => {}
            }

            let Some(config) = configs.config(&config_id) else {
                warn!("Config vanished, stopping scheduler");
                break;
            };

            let configured = config.period_duration();
            if configured != period {
                info!(
                    old_ms = period.as_millis() as u64,
                    new_ms = configured.as_millis() as u64,
                    "Period changed, resetting ticker"
                );
                period = configured;
                timer = interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }

            if config.suspended {
                if slot.state() != CycleState::Suspended {
                    info!("Config suspended");
                }
                slot.set_state(CycleState::Suspended);
                continue;
            }
            if slot.state() == CycleState::Suspended {
                info!("Config resumed");
                slot.set_state(CycleState::Idle);
            }

            if is_remote_managed(configs.as_ref(), &config) {
                debug!("Config involves a remote-managed site, skipping");
                continue;
            }

            let _running = slot.lock().await;
            if *shutdown_rx.borrow() {
                break;
            }
            if let Err(e) = reconciler.run_cycle(&config, &slot).await {
                warn!(error = %e, "Cycle skipped");
            }
        }

        slot.set_state(CycleState::Idle);
    }
    .instrument(span)
    .await
}
