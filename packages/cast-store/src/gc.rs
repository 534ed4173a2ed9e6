// Maintenance: orphan sweeping and ledger/store consistency checks
use crate::engine::Core;
use crate::error::{CoreError, CoreResult};
use crate::fingerprint::Fingerprint;
use crate::ledger::{index, ownership, quota};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;

/// Concurrent object reads during `verify`
const VERIFY_PARALLELISM: usize = 8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    /// Objects found with no ContentRecord
    pub orphans: Vec<Fingerprint>,
    pub removed: u64,
    pub bytes_freed: u64,
    /// Staged removals restored or finished
    pub staged_settled: u64,
}

/// Delete stored objects no ContentRecord claims, and settle removals left
/// staged by interrupted deletes.
///
/// Each orphan is re-checked under its fingerprint lock, so an ingest that
/// has written its object but not yet committed is never swept.
pub async fn sweep_orphans(core: &Core, dry_run: bool) -> CoreResult<SweepReport> {
    let recorded: HashSet<Fingerprint> = {
        let mut conn = core.db.pool().acquire().await?;
        index::all(&mut conn)
            .await?
            .into_iter()
            .map(|r| r.fingerprint)
            .collect()
    };

    let mut report = SweepReport {
        dry_run,
        ..Default::default()
    };

    for fingerprint in core.store.list().await? {
        if recorded.contains(&fingerprint) {
            continue;
        }
        report.orphans.push(fingerprint);
        if dry_run {
            continue;
        }

        if let Some(size) = core.discard_if_unreferenced(&fingerprint).await? {
            report.removed += 1;
            report.bytes_freed += size;
        }
    }

    let staged = core.store.list_staged().await?;
    if !dry_run {
        for fingerprint in &staged {
            core.settle_staged(fingerprint).await?;
            report.staged_settled += 1;
        }
    }

    tracing::info!(
        dry_run,
        orphans = report.orphans.len(),
        removed = report.removed,
        bytes_freed = report.bytes_freed,
        staged = staged.len(),
        "orphan sweep finished"
    );
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefCountMismatch {
    pub fingerprint: Fingerprint,
    pub recorded: u64,
    pub live_entries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaMismatch {
    pub owner_id: String,
    pub recorded: u64,
    pub expected: u64,
}

/// Snapshot consistency check. Operations running concurrently can show up
/// as transient mismatches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub records_checked: u64,
    pub ref_count_mismatches: Vec<RefCountMismatch>,
    /// Records whose object is gone from the store
    pub missing_objects: Vec<Fingerprint>,
    /// Objects whose bytes no longer hash to their fingerprint
    pub corrupt_objects: Vec<Fingerprint>,
    /// Fingerprints referenced by entries but lacking a record
    pub unrecorded_fingerprints: Vec<Fingerprint>,
    pub quota_mismatches: Vec<QuotaMismatch>,
}

impl VerifyReport {
    pub fn is_consistent(&self) -> bool {
        self.ref_count_mismatches.is_empty()
            && self.missing_objects.is_empty()
            && self.corrupt_objects.is_empty()
            && self.unrecorded_fingerprints.is_empty()
            && self.quota_mismatches.is_empty()
    }
}

enum ObjectState {
    Intact,
    Missing,
    Corrupt,
}

pub async fn verify(core: &Core) -> CoreResult<VerifyReport> {
    let (records, live, held, quotas) = {
        let mut conn = core.db.pool().acquire().await?;
        (
            index::all(&mut conn).await?,
            ownership::counts_by_fingerprint(&mut conn).await?,
            ownership::held_bytes_by_owner(&mut conn).await?,
            quota::all(&mut conn).await?,
        )
    };

    let mut report = VerifyReport {
        records_checked: records.len() as u64,
        ..Default::default()
    };

    for record in &records {
        let live_entries = live.get(&record.fingerprint).copied().unwrap_or(0);
        if live_entries != record.ref_count {
            report.ref_count_mismatches.push(RefCountMismatch {
                fingerprint: record.fingerprint,
                recorded: record.ref_count,
                live_entries,
            });
        }
    }

    let recorded: HashSet<Fingerprint> = records.iter().map(|r| r.fingerprint).collect();
    report.unrecorded_fingerprints = live
        .keys()
        .filter(|fp| !recorded.contains(fp))
        .copied()
        .collect();
    report.unrecorded_fingerprints.sort();

    let states: Vec<CoreResult<(Fingerprint, ObjectState)>> = stream::iter(records.iter())
        .map(|record| async move {
            let fingerprint = record.fingerprint;
            match core.store.get(&fingerprint).await {
                Ok(bytes) if Fingerprint::compute(&bytes) == fingerprint => {
                    Ok((fingerprint, ObjectState::Intact))
                }
                Ok(_) => Ok((fingerprint, ObjectState::Corrupt)),
                Err(CoreError::NotFound(_)) => Ok((fingerprint, ObjectState::Missing)),
                Err(err) => Err(err),
            }
        })
        .buffer_unordered(VERIFY_PARALLELISM)
        .collect()
        .await;

    for state in states {
        match state? {
            (_, ObjectState::Intact) => {}
            (fingerprint, ObjectState::Missing) => report.missing_objects.push(fingerprint),
            (fingerprint, ObjectState::Corrupt) => report.corrupt_objects.push(fingerprint),
        }
    }
    report.missing_objects.sort();
    report.corrupt_objects.sort();

    for (owner_id, record) in &quotas {
        let expected = held.get(owner_id).copied().unwrap_or(0);
        if record.bytes_charged != expected {
            report.quota_mismatches.push(QuotaMismatch {
                owner_id: owner_id.clone(),
                recorded: record.bytes_charged,
                expected,
            });
        }
    }
    for (owner_id, expected) in &held {
        if !quotas.contains_key(owner_id) {
            report.quota_mismatches.push(QuotaMismatch {
                owner_id: owner_id.clone(),
                recorded: 0,
                expected: *expected,
            });
        }
    }
    report.quota_mismatches.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));

    if report.is_consistent() {
        tracing::info!(records = report.records_checked, "verify found no problems");
    } else {
        tracing::warn!(
            records = report.records_checked,
            ref_counts = report.ref_count_mismatches.len(),
            missing = report.missing_objects.len(),
            corrupt = report.corrupt_objects.len(),
            unrecorded = report.unrecorded_fingerprints.len(),
            quotas = report.quota_mismatches.len(),
            "verify found inconsistencies"
        );
    }
    Ok(report)
}
