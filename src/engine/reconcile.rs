// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One reconciliation cycle for one config.
//!
//! # Cycle Leg
//!
//! ```text
//! connect source + destination ──→ both available? ──no──→ ConnectionUnavailable
//!            │ yes
//!            ↓
//! cursor = newest SUCCESS done_time for (source, destination)
//! failed = FAILURE ids below the retry limit
//!            │
//!            ↓
//! query page ──→ for each record:
//!                  retries used up?    → skip until modified again
//!                  deleted tag?        → DELETE
//!                  exists at dest?     → UPDATE
//!                  otherwise           → CREATE
//!                  direct: transfer + ledger.record
//!                  queued: offer TaskInfo to the destination queue
//!                          (queue full → deferred, retried next cycle)
//!            │
//!            ↓ (page full → next page)
//! CycleReport → sink
//! ```
//!
//! Item failures are recorded in the ledger and never end the cycle. An
//! adapter error triggers an availability re-probe; if either side is down
//! the leg stops with `ConnectionLost`. Ledger and queue failures stop the
//! leg with `Failure`. Shutdown or `cancel` stops it between items.

use super::scheduler::CycleSlot;
use super::types::{CycleReport, CycleState, CycleStatus};
use crate::adapter::{AdapterRegistry, SiteAdapter};
use crate::completion::{CompletionEvent, CompletionSink};
use crate::config::{Direction, EngineSettings, ExecutionMode, ReplicatorConfig};
use crate::config_store::ConfigStore;
use crate::error::{AdapterError, ReplicationError, Result};
use crate::ledger::{ItemLedger, ItemOutcome, ItemStatus, ReplicationItem};
use crate::model::{Metadata, QueryRequest};
use crate::queue::{Enqueued, Operation, QueueBroker, TaskInfo};
use crate::transfer;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Why a leg stopped early.
enum Abort {
    ConnectionLost(String),
    Canceled,
    Failure(String),
}

/// Per-item result inside a leg.
enum ItemResult {
    Succeeded,
    Failed,
    Enqueued,
    Deferred,
    Skipped,
}

/// Both ends of one leg, connected for the duration of the leg.
struct Leg<'a> {
    config: &'a ReplicatorConfig,
    direction: Direction,
    source: SiteAdapter,
    destination: SiteAdapter,
    source_name: String,
    destination_name: String,
}

/// Runs cycles. Shared by every scheduler and by `sync_now`.
pub(crate) struct Reconciler {
    exclude_destination: bool,
    page_size: usize,
    configs: Arc<dyn ConfigStore>,
    registry: Arc<AdapterRegistry>,
    ledger: Arc<dyn ItemLedger>,
    broker: Arc<QueueBroker>,
    sink: Arc<dyn CompletionSink>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconciler {
    pub(crate) fn new(
        settings: &EngineSettings,
        configs: Arc<dyn ConfigStore>,
        registry: Arc<AdapterRegistry>,
        ledger: Arc<dyn ItemLedger>,
        broker: Arc<QueueBroker>,
        sink: Arc<dyn CompletionSink>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            exclude_destination: settings.exclude_destination,
            page_size: settings.page_size,
            configs,
            registry,
            ledger,
            broker,
            sink,
            shutdown_rx,
        }
    }

    pub(crate) fn configs(&self) -> &Arc<dyn ConfigStore> {
        &self.configs
    }

    pub(crate) fn ledger(&self) -> &Arc<dyn ItemLedger> {
        &self.ledger
    }

    /// Run every leg the config's direction calls for. BOTH runs PULL, then
    /// PUSH only if PULL succeeded.
    ///
    /// Fails only when a referenced site or adapter type does not exist.
    pub(crate) async fn run_cycle(
        &self,
        config: &ReplicatorConfig,
        slot: &CycleSlot,
    ) -> Result<Vec<CycleReport>> {
        slot.reset_cancel();
        let span = info_span!("cycle", config_id = %config.id);
        async move {
            let mut reports = Vec::with_capacity(2);
            match config.direction {
                Direction::Push => {
                    reports.push(self.run_leg(config, Direction::Push, slot).await?);
                }
                Direction::Pull => {
                    reports.push(self.run_leg(config, Direction::Pull, slot).await?);
                }
                Direction::Both => {
                    let pull = self.run_leg(config, Direction::Pull, slot).await?;
                    let pulled = pull.status.is_success();
                    reports.push(pull);
                    if pulled {
                        reports.push(self.run_leg(config, Direction::Push, slot).await?);
                    } else {
                        debug!("Pull did not succeed, skipping push");
                    }
                }
            }
            Ok(reports)
        }
        .instrument(span)
        .await
    }

    fn is_canceled(&self, slot: &CycleSlot) -> bool {
        *self.shutdown_rx.borrow() || slot.is_cancel_requested()
    }

    async fn run_leg(
        &self,
        config: &ReplicatorConfig,
        direction: Direction,
        slot: &CycleSlot,
    ) -> Result<CycleReport> {
        let (source_id, destination_id) = match direction {
            Direction::Pull => (config.destination.as_str(), config.source.as_str()),
            _ => (config.source.as_str(), config.destination.as_str()),
        };
        let started = Instant::now();
        let mut report = CycleReport::new(&config.id, direction, source_id, destination_id);
        slot.set_state(CycleState::Querying);

        let source_site = self
            .configs
            .site(source_id)
            .ok_or_else(|| ReplicationError::not_found("site", source_id))?;
        let destination_site = self
            .configs
            .site(destination_id)
            .ok_or_else(|| ReplicationError::not_found("site", destination_id))?;

        let source = match self.registry.connect(&source_site).await {
            Ok(adapter) => adapter,
            Err(ReplicationError::Adapter(e)) => {
                return Ok(self.finish(report, CycleStatus::ConnectionUnavailable, Some(e.to_string()), started, slot));
            }
            Err(e) => return Err(e),
        };
        let destination = match self.registry.connect(&destination_site).await {
            Ok(adapter) => adapter,
            Err(e) => {
                source.close().await;
                return match e {
                    ReplicationError::Adapter(e) => Ok(self.finish(
                        report,
                        CycleStatus::ConnectionUnavailable,
                        Some(e.to_string()),
                        started,
                        slot,
                    )),
                    other => Err(other),
                };
            }
        };

        let outcome = self
            .drive(config, direction, source, destination, &mut report, slot)
            .await;

        Ok(match outcome {
            Ok(status) => self.finish(report, status, None, started, slot),
            Err(Abort::ConnectionLost(msg)) => {
                self.finish(report, CycleStatus::ConnectionLost, Some(msg), started, slot)
            }
            Err(Abort::Canceled) => self.finish(report, CycleStatus::Canceled, None, started, slot),
            Err(Abort::Failure(msg)) => self.finish(report, CycleStatus::Failure, Some(msg), started, slot),
        })
    }

    /// Connected part of a leg. Owns (and closes) both adapters.
    async fn drive(
        &self,
        config: &ReplicatorConfig,
        direction: Direction,
        source: SiteAdapter,
        destination: SiteAdapter,
        report: &mut CycleReport,
        slot: &CycleSlot,
    ) -> std::result::Result<CycleStatus, Abort> {
        let (source_up, destination_up) = tokio::join!(source.is_available(), destination.is_available());
        if !source_up || !destination_up {
            info!(
                source = %report.source_site,
                destination = %report.destination_site,
                source_up,
                destination_up,
                "Site unavailable, skipping cycle"
            );
            source.close().await;
            destination.close().await;
            return Ok(CycleStatus::ConnectionUnavailable);
        }

        let names = async {
            let source_name = source.system_name().await?;
            let destination_name = destination.system_name().await?;
            Ok::<_, AdapterError>((source_name, destination_name))
        }
        .await;
        let (source_name, destination_name) = match names {
            Ok(names) => names,
            Err(e) => {
                source.close().await;
                destination.close().await;
                return Ok(unavailable(report, e));
            }
        };

        let leg = Leg {
            config,
            direction,
            source,
            destination,
            source_name,
            destination_name,
        };
        let result = self.process_leg(&leg, report, slot).await;
        leg.source.close().await;
        leg.destination.close().await;
        result
    }

    async fn process_leg(
        &self,
        leg: &Leg<'_>,
        report: &mut CycleReport,
        slot: &CycleSlot,
    ) -> std::result::Result<CycleStatus, Abort> {
        let retry_limit = leg.config.retry_limit();
        let failed_ids = self
            .ledger
            .failure_list(retry_limit, &leg.source_name, &leg.destination_name)
            .await
            .map_err(|e| Abort::Failure(format!("failure list: {}", e)))?;
        let modified_after = self
            .ledger
            .last_success_time(&leg.source_name, &leg.destination_name)
            .await
            .map_err(|e| Abort::Failure(format!("cursor: {}", e)))?;

        let mut request = QueryRequest {
            predicate: leg.config.filter.clone(),
            excluded_sites: if self.exclude_destination {
                vec![leg.destination_name.clone()]
            } else {
                Vec::new()
            },
            failed_item_ids: failed_ids,
            modified_after,
            start_index: 0,
            page_size: self.page_size,
        };

        debug!(
            source = %leg.source_name,
            destination = %leg.destination_name,
            direction = ?leg.direction,
            cursor = ?modified_after,
            retrying = request.failed_item_ids.len(),
            "Querying source"
        );

        let mut seen: HashSet<String> = HashSet::new();
        loop {
            let response = match leg.source.query(request.clone()).await {
                Ok(response) => response,
                Err(e) => return Err(self.on_adapter_error(leg, e, "query").await),
            };
            slot.set_state(CycleState::Processing);

            let mut stream = response.into_stream();
            let mut page_items = 0usize;
            let mut page_new = 0usize;
            while let Some(item) = stream.next().await {
                if self.is_canceled(slot) {
                    info!(processed = report.processed, "Cycle canceled");
                    return Err(Abort::Canceled);
                }
                page_items += 1;

                let metadata = match item {
                    Ok(metadata) => metadata,
                    Err(e) => return Err(self.on_adapter_error(leg, e, "query stream").await),
                };
                if !seen.insert(metadata.id.clone()) {
                    continue;
                }
                page_new += 1;
                report.processed += 1;

                match self.process_item(leg, metadata, report).await? {
                    ItemResult::Succeeded => report.succeeded += 1,
                    ItemResult::Failed => report.failed += 1,
                    ItemResult::Enqueued => report.enqueued += 1,
                    ItemResult::Deferred => report.deferred += 1,
                    ItemResult::Skipped => {}
                }
            }

            if request.page_size == 0 || page_items < request.page_size || page_new == 0 {
                break;
            }
            request.start_index += page_items;
        }

        Ok(CycleStatus::Success)
    }

    async fn process_item(
        &self,
        leg: &Leg<'_>,
        metadata: Metadata,
        report: &mut CycleReport,
    ) -> std::result::Result<ItemResult, Abort> {
        let row = self
            .ledger
            .get(&metadata.id, &leg.source_name, &leg.destination_name)
            .await
            .map_err(|e| Abort::Failure(format!("ledger: {}", e)))?;
        let prior_failures = match &row {
            Some(row) if row.is_exhausted(leg.config.retry_limit(), metadata.metadata_modified) => {
                debug!(
                    metadata_id = %metadata.id,
                    failure_count = row.failure_count,
                    "Retry limit reached, skipping until modified"
                );
                return Ok(ItemResult::Skipped);
            }
            Some(row) if row.status == ItemStatus::Failure => row.failure_count,
            _ => 0,
        };

        let operation = if metadata.is_deleted() {
            Operation::Delete
        } else {
            match leg.destination.exists(&metadata).await {
                Ok(exists) => transfer::classify(&metadata, exists),
                Err(e) => {
                    debug!(metadata_id = %metadata.id, error = %e, "Existence probe failed");
                    self.record_failure(leg, &metadata, Operation::Create).await?;
                    self.on_item_error(leg, e).await?;
                    return Ok(ItemResult::Failed);
                }
            }
        };

        match leg.config.mode {
            ExecutionMode::Queued => self.enqueue(leg, &metadata, operation, prior_failures).await,
            ExecutionMode::Direct => self.execute(leg, metadata, operation, prior_failures, report).await,
        }
    }

    async fn enqueue(
        &self,
        leg: &Leg<'_>,
        metadata: &Metadata,
        operation: Operation,
        prior_failures: u32,
    ) -> std::result::Result<ItemResult, Abort> {
        let queue = self
            .broker
            .get_queue(&leg.destination.site().id)
            .map_err(|e| Abort::Failure(e.to_string()))?;
        let info = TaskInfo::new(
            leg.config,
            &leg.source.site().id,
            &leg.destination.site().id,
            metadata,
            operation,
        )
        .with_prior_attempts(prior_failures);
        let offered = queue
            .try_offer(info)
            .await
            .map_err(|e| Abort::Failure(e.to_string()))?;
        match offered {
            Enqueued::Queued => Ok(ItemResult::Enqueued),
            Enqueued::Duplicate => {
                debug!(metadata_id = %metadata.id, "Task already queued");
                Ok(ItemResult::Skipped)
            }
            Enqueued::Full => {
                warn!(
                    metadata_id = %metadata.id,
                    site = %queue.site(),
                    "Destination queue full, deferring record"
                );
                self.ledger
                    .record(ItemOutcome::deferred(
                        &metadata.id,
                        &leg.source_name,
                        &leg.destination_name,
                        &leg.config.id,
                    ))
                    .await
                    .map_err(|e| Abort::Failure(format!("ledger: {}", e)))?;
                Ok(ItemResult::Deferred)
            }
        }
    }

    async fn execute(
        &self,
        leg: &Leg<'_>,
        metadata: Metadata,
        operation: Operation,
        prior_failures: u32,
        report: &mut CycleReport,
    ) -> std::result::Result<ItemResult, Abort> {
        let metadata_id = metadata.id.clone();

        let result = transfer::execute(
            &leg.source,
            &leg.destination,
            &leg.source_name,
            &leg.destination_name,
            metadata,
            operation,
        )
        .await;

        match result {
            Ok(outcome) if outcome.accepted => {
                self.ledger
                    .record(ItemOutcome::success(
                        &metadata_id,
                        &leg.source_name,
                        &leg.destination_name,
                        &leg.config.id,
                        outcome.resource_bytes,
                        outcome.metadata_bytes,
                    ))
                    .await
                    .map_err(|e| Abort::Failure(format!("ledger: {}", e)))?;
                report.resource_bytes += outcome.resource_bytes;
                report.metadata_bytes += outcome.metadata_bytes;
                self.sink.on_completion(&CompletionEvent {
                    config_id: leg.config.id.clone(),
                    metadata_id,
                    source: leg.source_name.clone(),
                    destination: leg.destination_name.clone(),
                    operation,
                    status: ItemStatus::Success,
                    terminal: true,
                    attempts: prior_failures + 1,
                    resource_bytes: outcome.resource_bytes,
                    metadata_bytes: outcome.metadata_bytes,
                });
                Ok(ItemResult::Succeeded)
            }
            Ok(_) => {
                debug!(metadata_id = %metadata_id, %operation, "Destination rejected record");
                self.record_failure_by_id(leg, &metadata_id, operation).await?;
                Ok(ItemResult::Failed)
            }
            Err(e) => {
                debug!(metadata_id = %metadata_id, %operation, error = %e, "Transfer failed");
                self.record_failure_by_id(leg, &metadata_id, operation).await?;
                self.on_item_error(leg, e).await.map(|_| ItemResult::Failed)
            }
        }
    }

    async fn record_failure(
        &self,
        leg: &Leg<'_>,
        metadata: &Metadata,
        operation: Operation,
    ) -> std::result::Result<ReplicationItem, Abort> {
        self.record_failure_by_id(leg, &metadata.id, operation).await
    }

    /// Merge a FAILURE and report it; terminal once the retry limit is hit.
    async fn record_failure_by_id(
        &self,
        leg: &Leg<'_>,
        metadata_id: &str,
        operation: Operation,
    ) -> std::result::Result<ReplicationItem, Abort> {
        let row = self
            .ledger
            .record(ItemOutcome::failure(
                metadata_id,
                &leg.source_name,
                &leg.destination_name,
                &leg.config.id,
            ))
            .await
            .map_err(|e| Abort::Failure(format!("ledger: {}", e)))?;

        let terminal = row.failure_count >= leg.config.retry_limit();
        if terminal {
            warn!(
                metadata_id,
                failure_count = row.failure_count,
                "Item reached retry limit"
            );
        }
        self.sink.on_completion(&CompletionEvent {
            config_id: leg.config.id.clone(),
            metadata_id: metadata_id.to_string(),
            source: leg.source_name.clone(),
            destination: leg.destination_name.clone(),
            operation,
            status: ItemStatus::Failure,
            terminal,
            attempts: row.failure_count,
            resource_bytes: 0,
            metadata_bytes: 0,
        });
        Ok(row)
    }

    /// After an item-level adapter error: keep going unless a site went down.
    async fn on_item_error(&self, leg: &Leg<'_>, error: AdapterError) -> std::result::Result<(), Abort> {
        let (source_up, destination_up) =
            tokio::join!(leg.source.is_available(), leg.destination.is_available());
        if source_up && destination_up {
            return Ok(());
        }
        warn!(source_up, destination_up, error = %error, "Connection lost mid-cycle");
        Err(Abort::ConnectionLost(error.to_string()))
    }

    /// Query-level adapter error: always ends the leg.
    async fn on_adapter_error(&self, leg: &Leg<'_>, error: AdapterError, operation: &str) -> Abort {
        match self.on_item_error(leg, error.clone()).await {
            Err(abort) => abort,
            Ok(()) => {
                warn!(operation, error = %error, "Source query failed");
                Abort::Failure(format!("{}: {}", operation, error))
            }
        }
    }

    fn finish(
        &self,
        mut report: CycleReport,
        status: CycleStatus,
        error: Option<String>,
        started: Instant,
        slot: &CycleSlot,
    ) -> CycleReport {
        report.status = status;
        if error.is_some() {
            report.error = error;
        }
        report.duration = started.elapsed();
        slot.set_state(CycleState::Idle);

        match status {
            CycleStatus::Success => info!(
                direction = ?report.direction,
                processed = report.processed,
                succeeded = report.succeeded,
                failed = report.failed,
                enqueued = report.enqueued,
                deferred = report.deferred,
                bytes = report.total_bytes(),
                duration_ms = report.duration.as_millis() as u64,
                "Cycle complete"
            ),
            _ => warn!(
                direction = ?report.direction,
                %status,
                processed = report.processed,
                error = report.error.as_deref().unwrap_or(""),
                "Cycle ended early"
            ),
        }
        self.sink.on_cycle(&report);
        report
    }
}

fn unavailable(report: &mut CycleReport, error: AdapterError) -> CycleStatus {
    report.error = Some(error.to_string());
    CycleStatus::ConnectionUnavailable
}
