// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-unit resync: discover completed items the unit does not hold, copy
//! them from the buffer (or another unit), then record the mapping.
//!
//! Each item is handled independently. An error on one item is logged and
//! the item is picked up again on a later tick, since discovery only returns
//! items without a mapping on the unit. Items that failed before go to the
//! back of the batch, so a few items that never sync cannot starve newer
//! ones. Rejected credentials on the target end the pass and put the unit
//! into exponential backoff. Errors from a unit that is only read as a
//! source never do.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::types::{ResyncReport, Shutdown};
use crate::config::ResyncSettings;
use crate::convergent::hash_bytes;
use crate::index::{Item, LoadOptions};
use crate::metrics;
use crate::storage::repository::UnitRepository;
use crate::storage::traits::StorageError;
use crate::storage::{Buffer, ItemUnit, StorageUnit, Unit};

/// Everything a resync task needs, cheap to clone into each task.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub(crate) repo: UnitRepository,
    pub(crate) buffer: Arc<Buffer>,
    pub(crate) units: Arc<HashMap<String, Arc<StorageUnit>>>,
    /// Keyed by unit id. Locked for the whole of a pass.
    pub(crate) passes: Arc<HashMap<String, Arc<Mutex<PassState>>>>,
    pub(crate) settings: ResyncSettings,
}

/// What a unit remembers between passes.
#[derive(Debug, Default)]
pub(crate) struct PassState {
    /// Item id to the time it last failed on this unit.
    deferred: HashMap<String, Instant>,
}

impl PassState {
    /// Pick at most `limit` ids from `found`: items that have not failed
    /// first (discovery order), then failed ones, least recently failed
    /// first. `fetched` is the limit discovery ran with; a short result
    /// means `found` is the whole backlog, so deferrals not in it are
    /// dropped.
    pub(crate) fn plan(&mut self, found: Vec<String>, limit: usize, fetched: usize) -> Vec<String> {
        if found.len() < fetched {
            let pending: HashSet<&str> = found.iter().map(String::as_str).collect();
            self.deferred.retain(|id, _| pending.contains(id.as_str()));
        }

        let (mut retry, fresh): (Vec<String>, Vec<String>) =
            found.into_iter().partition(|id| self.deferred.contains_key(id));
        retry.sort_by_key(|id| self.deferred.get(id).copied());

        fresh.into_iter().chain(retry).take(limit).collect()
    }

    fn failed(&mut self, item_id: &str) {
        self.deferred.insert(item_id.to_string(), Instant::now());
    }

    fn succeeded(&mut self, item_id: &str) {
        self.deferred.remove(item_id);
    }

    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}

enum SyncOutcome {
    Written,
    AlreadyRecorded,
}

/// Build the mapping `item` would have on `unit`. Not persisted.
pub(crate) fn new_item_unit(unit: &dyn Unit, item: &Item) -> Result<ItemUnit, StorageError> {
    Ok(ItemUnit {
        id: uuid::Uuid::new_v4().to_string(),
        item_id: item.id.clone(),
        unit_id: unit.id().to_string(),
        locator: unit.new_locator(item)?,
        created: 0,
        item: item.clone(),
    })
}

/// `interval * 2^failures`, capped at `max` but never below `interval`.
pub(crate) fn backoff_delay(interval: Duration, failures: u32, max: Duration) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(max).max(interval)
}

/// Tick loop for one unit. Returns once shutdown is signalled.
pub(crate) async fn run_unit_loop(ctx: SyncContext, unit: Arc<StorageUnit>, mut shutdown: Shutdown) {
    let interval = unit.sync_interval();
    let max_backoff = ctx.settings.max_backoff();
    let mut fatal_passes = 0u32;

    info!(unit = %unit.name(), interval_ms = interval.as_millis() as u64, "Resync loop started");

    loop {
        let delay = backoff_delay(interval, fatal_passes, max_backoff);
        metrics::set_resync_backoff(unit.name(), if fatal_passes == 0 { Duration::ZERO } else { delay });

        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match run_pass(&ctx, &unit, &shutdown).await {
            Ok(report) if report.fatal => {
                fatal_passes = fatal_passes.saturating_add(1);
                warn!(
                    unit = %unit.name(),
                    consecutive = fatal_passes,
                    next_in_ms = backoff_delay(interval, fatal_passes, max_backoff).as_millis() as u64,
                    "Unit rejected credentials, backing off"
                );
            }
            Ok(_) => fatal_passes = 0,
            Err(e) if e.is_fatal() => {
                fatal_passes = fatal_passes.saturating_add(1);
                warn!(unit = %unit.name(), error = %e, "Resync pass failed, backing off");
            }
            Err(e) => {
                warn!(unit = %unit.name(), error = %e, "Resync pass failed, retrying next tick");
            }
        }

        if shutdown.is_triggered() {
            break;
        }
    }

    info!(unit = %unit.name(), "Resync loop stopped");
}

/// One discovery + sync pass over `unit`.
#[tracing::instrument(skip(ctx, unit, shutdown), fields(unit = %unit.name()))]
pub(crate) async fn run_pass(
    ctx: &SyncContext,
    unit: &StorageUnit,
    shutdown: &Shutdown,
) -> Result<ResyncReport, StorageError> {
    let slot = ctx
        .passes
        .get(unit.id())
        .cloned()
        .ok_or_else(|| StorageError::NotFound(format!("storage unit {}", unit.id())))?;
    let mut state = slot.lock().await;

    let start = Instant::now();
    let mut report = ResyncReport::new(unit.name());

    let fetch = ctx.settings.batch_limit.saturating_add(state.deferred_len());
    let found = match ctx.repo.load_all_item_id_unknown_by_unit(unit.id(), fetch).await {
        Ok(ids) => ids,
        Err(e) => {
            metrics::record_resync_abort(unit.name(), "discovery");
            return Err(e);
        }
    };
    let ids = state.plan(found, ctx.settings.batch_limit, fetch);
    report.discovered = ids.len();

    for item_id in &ids {
        if shutdown.is_triggered() {
            report.cancelled = true;
            break;
        }

        match tokio::time::timeout(ctx.settings.item_timeout(), sync_item(ctx, unit, item_id)).await {
            Ok(Ok(SyncOutcome::Written)) => {
                report.synced += 1;
                state.succeeded(item_id);
            }
            Ok(Ok(SyncOutcome::AlreadyRecorded)) => {
                report.synced += 1;
                report.already_recorded += 1;
                state.succeeded(item_id);
            }
            Ok(Err(e)) if e.is_fatal() => {
                report.failed += 1;
                report.fatal = true;
                error!(item_id = %item_id, error = %e, "Unit rejected the write");
                break;
            }
            Ok(Err(e)) if e.is_integrity() => {
                report.failed += 1;
                state.failed(item_id);
                error!(item_id = %item_id, error = %e, "Item failed integrity checks, skipping");
            }
            Ok(Err(e)) => {
                report.failed += 1;
                state.failed(item_id);
                warn!(item_id = %item_id, error = %e, "Item sync failed, skipping");
            }
            Err(_) => {
                report.failed += 1;
                state.failed(item_id);
                metrics::record_timeout(unit.name(), "resync_item");
                warn!(
                    item_id = %item_id,
                    timeout_ms = ctx.settings.item_timeout_ms,
                    "Item sync timed out, skipping"
                );
            }
        }
    }

    report.duration = start.elapsed();
    metrics::record_resync_pass(unit.name(), report.discovered, report.synced, report.failed, report.duration);
    metrics::set_backend_healthy(unit.name(), !report.fatal);
    if report.cancelled {
        metrics::record_resync_abort(unit.name(), "shutdown");
    }
    if report.fatal {
        metrics::record_resync_abort(unit.name(), "fatal");
    }

    if report.discovered > 0 {
        info!(
            discovered = report.discovered,
            synced = report.synced,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "Resync pass complete"
        );
    } else {
        debug!("Resync pass found nothing to do");
    }
    Ok(report)
}

async fn sync_item(ctx: &SyncContext, unit: &StorageUnit, item_id: &str) -> Result<SyncOutcome, StorageError> {
    let item = ctx.repo.index().load_item_by_id(item_id, LoadOptions::WITH_DECRYPTION).await?;
    if !item.is_completed() || item.hash.is_empty() {
        return Err(StorageError::InvalidInput(format!("item {} is not completed", item.id)));
    }

    let content = source_content(ctx, unit, &item).await?;

    let mut item_unit = new_item_unit(unit, &item)?;
    let mut writer = unit.new_writer(&item_unit)?;
    writer
        .write_all(&content)
        .await
        .map_err(|e| StorageError::Backend(format!("staging item {}: {}", item.id, e)))?;
    writer.close().await?;

    if ctx.settings.verify_after_write && !unit.item_exists(&item).await? {
        return Err(StorageError::Backend(format!(
            "item {} not visible on unit '{}' after write",
            item.id,
            unit.name()
        )));
    }

    match ctx.repo.insert_item_unit(&mut item_unit).await {
        Ok(()) => {
            debug!(item_id = %item.id, bytes = content.len(), "Item synced");
            Ok(SyncOutcome::Written)
        }
        Err(StorageError::AlreadyExists(_)) => {
            debug!(item_id = %item.id, "Item already recorded on unit");
            Ok(SyncOutcome::AlreadyRecorded)
        }
        Err(e) => Err(e),
    }
}

/// Content of `item` from the buffer if it still holds it, else from any
/// other unit with a mapping. Every candidate is checked against the item
/// hash before use.
async fn source_content(ctx: &SyncContext, target: &StorageUnit, item: &Item) -> Result<Vec<u8>, StorageError> {
    let mappings = ctx.repo.load_item_units_by_item(&item.id, LoadOptions::WITH_DECRYPTION).await?;

    let buffer_mapping = match mappings.iter().find(|m| m.unit_id == ctx.buffer.id()) {
        Some(mapping) => mapping.clone(),
        None => new_item_unit(ctx.buffer.as_ref(), item)?,
    };

    let mut candidates: Vec<(&dyn Unit, ItemUnit)> = vec![(ctx.buffer.as_ref() as &dyn Unit, buffer_mapping)];
    for mapping in mappings {
        if mapping.unit_id == target.id() {
            continue;
        }
        if let Some(source) = ctx.units.get(&mapping.unit_id) {
            candidates.push((source.as_ref() as &dyn Unit, mapping));
        }
    }

    let mut last_error = None;
    for (source, mapping) in candidates {
        let mut reader = match source.new_reader(&mapping).await {
            Ok(reader) => reader,
            Err(e) => {
                debug!(item_id = %item.id, source = %source.name(), error = %e, "Source unavailable");
                last_error = Some(source_error(source, e));
                continue;
            }
        };

        let mut content = Vec::with_capacity(reader.len());
        reader
            .read_to_end(&mut content)
            .await
            .map_err(|e| StorageError::Backend(format!("reading item {} from '{}': {}", item.id, source.name(), e)))?;

        if hash_bytes(&content) == item.hash {
            return Ok(content);
        }
        // An emptied buffer reads as no content; not a tamper
        if !(content.is_empty() && source.id() == ctx.buffer.id()) {
            warn!(item_id = %item.id, source = %source.name(), "Source content does not match item hash");
            metrics::record_integrity_failure(source.name());
        }
        last_error = Some(StorageError::Integrity(format!(
            "content of item {} on '{}' does not match its hash",
            item.id,
            source.name()
        )));
    }

    Err(last_error.unwrap_or_else(|| StorageError::NotFound(format!("no source holds item {}", item.id))))
}

/// A source's fatal error belongs to the source, not to the unit being
/// synced.
fn source_error(source: &dyn Unit, err: StorageError) -> StorageError {
    match err {
        StorageError::Fatal(msg) => StorageError::Backend(format!("source '{}': {}", source.name(), msg)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let interval = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(interval, 0, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(interval, 1, max), Duration::from_secs(2));
        assert_eq!(backoff_delay(interval, 3, max), Duration::from_secs(8));
        assert_eq!(backoff_delay(interval, 4, max), Duration::from_secs(10));
        assert_eq!(backoff_delay(interval, 200, max), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_never_below_interval() {
        let interval = Duration::from_secs(60);
        assert_eq!(backoff_delay(interval, 2, Duration::from_secs(5)), interval);
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_plan_puts_failed_items_last() {
        let mut state = PassState::default();
        state.failed("old");

        // "old" sorts first in discovery but has failed before
        let plan = state.plan(ids(&["old", "new"]), 1, 2);
        assert_eq!(plan, ids(&["new"]));

        // Nothing fresh left: failed items still get their turn
        let plan = state.plan(ids(&["old"]), 1, 2);
        assert_eq!(plan, ids(&["old"]));
    }

    #[test]
    fn test_plan_rotates_failed_items() {
        let mut state = PassState::default();
        state.failed("a");
        std::thread::sleep(Duration::from_millis(2));
        state.failed("b");

        assert_eq!(state.plan(ids(&["a", "b"]), 1, 3), ids(&["a"]));
        std::thread::sleep(Duration::from_millis(2));
        state.failed("a");
        assert_eq!(state.plan(ids(&["a", "b"]), 1, 3), ids(&["b"]));
    }

    #[test]
    fn test_plan_forgets_items_no_longer_pending() {
        let mut state = PassState::default();
        state.failed("gone");
        state.failed("stuck");

        // Short result: the whole backlog is visible
        state.plan(ids(&["stuck"]), 10, 12);
        assert_eq!(state.deferred_len(), 1);

        state.succeeded("stuck");
        assert_eq!(state.deferred_len(), 0);
    }

    #[test]
    fn test_plan_keeps_deferrals_beyond_a_full_page() {
        let mut state = PassState::default();
        state.failed("later");
        state.plan(ids(&["x", "y"]), 1, 2);
        assert_eq!(state.deferred_len(), 1);
    }
}
