// intelmesh/src/store.rs
//
// Durable tables on sled, one database directory, five trees:
//   meta          — schema_version row
//   iocs          — id → Ioc row (JSON)
//   ioc_reports   — "{ioc_id}/{client_id}" → IocReport row
//   trust_scores  — client_id → TrustScore row
//   trust_events  — zero-padded sequence → TrustEvent row (append-only)
//
// Reverse indexes are rebuilt into memory on open and maintained on every
// write: status set, verified_at ordering (the sync cursor index), and a
// reporter index. The per-IOC lock stripe serializes the read-modify-write
// submit section; distinct IOCs progress in parallel.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use tracing::{info, warn};

use crate::error::{CoordError, Result};
use crate::events::{Ioc, IocReport, IocStatus, TrustEvent, TrustScore};

const SCHEMA_VERSION: u32 = 1;
const N_STRIPES: usize = 64;

pub struct Store {
    db:           sled::Db,
    iocs:         sled::Tree,
    reports:      sled::Tree,
    trust:        sled::Tree,
    trust_events: sled::Tree,
    meta:         sled::Tree,

    // In-memory indexes, rebuilt on open
    status_idx:   DashMap<IocStatus, HashSet<String>>,
    verified_idx: RwLock<BTreeMap<(i64, String), ()>>,   // (verified_at secs, id)
    reporter_idx: DashMap<String, HashSet<String>>,      // client_id → ioc ids

    stripes:   Vec<Mutex<()>>,
    event_seq: AtomicU64,

    pub total_iocs:    AtomicU64,
    pub verified_iocs: AtomicU64,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let db           = sled::open(path)?;
        let iocs         = db.open_tree("iocs")?;
        let reports      = db.open_tree("ioc_reports")?;
        let trust        = db.open_tree("trust_scores")?;
        let trust_events = db.open_tree("trust_events")?;
        let meta         = db.open_tree("meta")?;

        let store = Self {
            db, iocs, reports, trust, trust_events, meta,
            status_idx:    DashMap::new(),
            verified_idx:  RwLock::new(BTreeMap::new()),
            reporter_idx:  DashMap::new(),
            stripes:       (0..N_STRIPES).map(|_| Mutex::new(())).collect(),
            event_seq:     AtomicU64::new(0),
            total_iocs:    AtomicU64::new(0),
            verified_iocs: AtomicU64::new(0),
        };
        store.check_schema()?;
        store.rebuild_indexes()?;
        Ok(store)
    }

    /// Serialize all mutation of one IOC row. Stripe keyed by id hash, so
    /// unrelated rows rarely contend.
    pub fn lock_row(&self, ioc_id: &str) -> MutexGuard<'_, ()> {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        ioc_id.hash(&mut h);
        self.stripes[(h.finish() as usize) % N_STRIPES].lock()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // ── Schema ────────────────────────────────────────────────────────────────

    fn check_schema(&self) -> Result<()> {
        match self.meta.get("schema_version")? {
            None => {
                self.meta.insert("schema_version", SCHEMA_VERSION.to_string().as_bytes())?;
                info!(version = SCHEMA_VERSION, "store initialized");
                Ok(())
            }
            Some(raw) => {
                let found: u32 = String::from_utf8_lossy(&raw)
                    .parse()
                    .map_err(|_| CoordError::Internal("unreadable schema_version".into()))?;
                if found > SCHEMA_VERSION {
                    return Err(CoordError::Internal(format!(
                        "store schema {found} is newer than supported {SCHEMA_VERSION}"
                    )));
                }
                for v in found..SCHEMA_VERSION {
                    self.migrate_from(v)?;
                }
                if found < SCHEMA_VERSION {
                    self.meta.insert("schema_version", SCHEMA_VERSION.to_string().as_bytes())?;
                    info!(from = found, to = SCHEMA_VERSION, "store migrated");
                }
                Ok(())
            }
        }
    }

    fn migrate_from(&self, version: u32) -> Result<()> {
        match version {
            // v0 trust rows predate the outcome history ring; backfill empty.
            0 => {
                for entry in self.trust.iter() {
                    let (k, v) = entry?;
                    let mut row: serde_json::Value = serde_json::from_slice(&v)?;
                    if row.get("outcome_history").is_none() {
                        row["outcome_history"] = serde_json::json!([]);
                        self.trust.insert(k, serde_json::to_vec(&row)?)?;
                    }
                }
                Ok(())
            }
            v => Err(CoordError::Internal(format!("no migration from schema {v}"))),
        }
    }

    fn rebuild_indexes(&self) -> Result<()> {
        let mut n = 0u64;
        for entry in self.iocs.iter() {
            let (_, v) = entry?;
            let ioc: Ioc = serde_json::from_slice(&v)?;
            self.status_idx.entry(ioc.status).or_default().insert(ioc.id.clone());
            if ioc.status == IocStatus::Verified {
                if let Some(ts) = ioc.verified_at {
                    self.verified_idx.write().insert((ts.timestamp(), ioc.id.clone()), ());
                    self.verified_iocs.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!(ioc = %ioc.id, "verified row without verified_at, index skipped");
                }
            }
            n += 1;
        }
        self.total_iocs.store(n, Ordering::Relaxed);

        for entry in self.reports.iter() {
            let (_, v) = entry?;
            let report: IocReport = serde_json::from_slice(&v)?;
            self.reporter_idx.entry(report.client_id).or_default().insert(report.ioc_id);
        }

        if let Some((k, _)) = self.trust_events.last()? {
            let seq: u64 = String::from_utf8_lossy(&k).parse().unwrap_or(0);
            self.event_seq.store(seq + 1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ── IOC rows ──────────────────────────────────────────────────────────────

    pub fn get_ioc(&self, id: &str) -> Result<Option<Ioc>> {
        match self.iocs.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None    => Ok(None),
        }
    }

    /// Atomically write an IOC row together with one report row.
    /// Callers hold the row lock; index maintenance happens after commit.
    pub fn put_ioc_with_report(&self, ioc: &Ioc, report: &IocReport) -> Result<()> {
        let prev = self.get_ioc(&ioc.id)?;
        let ioc_val = serde_json::to_vec(ioc)?;
        let rep_key = report_key(&report.ioc_id, &report.client_id);
        let rep_val = serde_json::to_vec(report)?;

        (&self.iocs, &self.reports)
            .transaction(|(ioc_t, rep_t)| {
                ioc_t.insert(ioc.id.as_bytes(), ioc_val.as_slice())?;
                rep_t.insert(rep_key.as_bytes(), rep_val.as_slice())?;
                Ok::<(), ConflictableTransactionError>(())
            })
            .map_err(|e: TransactionError| CoordError::Internal(format!("txn: {e}")))?;

        self.reporter_idx
            .entry(report.client_id.clone())
            .or_default()
            .insert(ioc.id.clone());
        self.apply_index_transition(prev.as_ref(), ioc);
        Ok(())
    }

    /// Write an IOC row alone (status transitions from sweeps / admin expire).
    pub fn put_ioc(&self, ioc: &Ioc) -> Result<()> {
        let prev = self.get_ioc(&ioc.id)?;
        self.iocs.insert(ioc.id.as_bytes(), serde_json::to_vec(ioc)?)?;
        self.apply_index_transition(prev.as_ref(), ioc);
        Ok(())
    }

    fn apply_index_transition(&self, prev: Option<&Ioc>, next: &Ioc) {
        let prev_status = prev.map(|p| p.status);
        if prev.is_none() {
            self.total_iocs.fetch_add(1, Ordering::Relaxed);
        }
        if prev_status != Some(next.status) {
            if let Some(ps) = prev_status {
                self.status_idx.entry(ps).or_default().remove(&next.id);
            }
            self.status_idx.entry(next.status).or_default().insert(next.id.clone());

            // verified_idx tracks only currently-verified rows
            if next.status == IocStatus::Verified {
                if let Some(ts) = next.verified_at {
                    self.verified_idx.write().insert((ts.timestamp(), next.id.clone()), ());
                    self.verified_iocs.fetch_add(1, Ordering::Relaxed);
                }
            } else if prev_status == Some(IocStatus::Verified) {
                if let Some(ts) = prev.and_then(|p| p.verified_at) {
                    self.verified_idx.write().remove(&(ts.timestamp(), next.id.clone()));
                }
                self.verified_iocs.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_report(&self, ioc_id: &str, client_id: &str) -> Result<Option<IocReport>> {
        match self.reports.get(report_key(ioc_id, client_id).as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None    => Ok(None),
        }
    }

    pub fn reports_for(&self, ioc_id: &str) -> Result<Vec<IocReport>> {
        let mut out = Vec::new();
        for entry in self.reports.scan_prefix(format!("{ioc_id}/").as_bytes()) {
            let (_, v) = entry?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    /// Every IOC a given client has reported, via the reporter index.
    /// Serves the per-client provenance view without scanning all reports.
    pub fn iocs_reported_by(&self, client_id: &str) -> Result<Vec<Ioc>> {
        let ids: Vec<String> = self
            .reporter_idx
            .get(client_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ioc) = self.get_ioc(&id)? {
                out.push(ioc);
            }
        }
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(out)
    }

    // ── IOC queries ───────────────────────────────────────────────────────────

    pub fn iocs_with_status(&self, status: IocStatus) -> Result<Vec<Ioc>> {
        let ids: Vec<String> = self
            .status_idx
            .get(&status)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ioc) = self.get_ioc(&id)? {
                out.push(ioc);
            }
        }
        Ok(out)
    }

    pub fn all_iocs(&self) -> Result<Vec<Ioc>> {
        let mut out = Vec::new();
        for entry in self.iocs.iter() {
            let (_, v) = entry?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    /// Verified rows with `verified_at > cursor` (unix seconds), ascending by
    /// `verified_at`. This is the pull-sync scan.
    pub fn verified_since(&self, cursor: i64) -> Result<Vec<Ioc>> {
        let ids: Vec<String> = self
            .verified_idx
            .read()
            .range((cursor + 1, String::new())..)
            .map(|((_, id), _)| id.clone())
            .collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ioc) = self.get_ioc(&id)? {
                out.push(ioc);
            }
        }
        Ok(out)
    }

    /// The most recent `limit` verified rows, ascending by `verified_at`.
    /// Serves the initial snapshot for clients with no stored cursor.
    pub fn recent_verified(&self, limit: usize) -> Result<Vec<Ioc>> {
        let mut ids: Vec<String> = self
            .verified_idx
            .read()
            .iter()
            .rev()
            .take(limit)
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.reverse();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ioc) = self.get_ioc(&id)? {
                out.push(ioc);
            }
        }
        Ok(out)
    }

    pub fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<Ioc>> {
        Ok(self
            .iocs_with_status(IocStatus::Pending)?
            .into_iter()
            .filter(|i| i.last_seen < cutoff)
            .collect())
    }

    // ── Trust rows ────────────────────────────────────────────────────────────

    pub fn get_trust(&self, client_id: &str) -> Result<Option<TrustScore>> {
        match self.trust.get(client_id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None    => Ok(None),
        }
    }

    pub fn put_trust(&self, score: &TrustScore) -> Result<()> {
        self.trust.insert(score.client_id.as_bytes(), serde_json::to_vec(score)?)?;
        Ok(())
    }

    pub fn snapshot_trust(&self) -> Result<Vec<TrustScore>> {
        let mut out = Vec::new();
        for entry in self.trust.iter() {
            let (_, v) = entry?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn append_trust_event(&self, event: &TrustEvent) -> Result<()> {
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        self.trust_events
            .insert(format!("{seq:020}").as_bytes(), serde_json::to_vec(event)?)?;
        Ok(())
    }

    pub fn trust_events_for(&self, client_id: &str, limit: usize) -> Result<Vec<TrustEvent>> {
        let mut out = Vec::new();
        for entry in self.trust_events.iter().rev() {
            let (_, v) = entry?;
            let ev: TrustEvent = serde_json::from_slice(&v)?;
            if ev.client_id == client_id {
                out.push(ev);
                if out.len() == limit { break; }
            }
        }
        out.reverse();
        Ok(out)
    }
}

fn report_key(ioc_id: &str, client_id: &str) -> String {
    format!("{ioc_id}/{client_id}")
}
