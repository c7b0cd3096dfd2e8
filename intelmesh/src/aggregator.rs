// intelmesh/src/aggregator.rs
//
// IOC deduplication and the pending → verified → expired lifecycle.
//
// Submissions are idempotent on (ioc_id, client_id) and serialized per IOC
// row through the store's lock stripe; distinct IOCs progress in parallel.
// Promotion is decided by `consensus_met`, a pure function over
// (report_count, mean reporter trust, threat level, config), and commits to
// the store before `newly_verified` is surfaced, so a store failure can
// never produce a phantom verification.
//
// The Aggregator holds a read-only handle on the Trust Manager (get /
// snapshot). Outcome credits flow the other way through an mpsc queue that
// the coordinator drains, keeping the dependency one-directional.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CoordError, Result};
use crate::events::{
    ioc_id, Ioc, IocFilter, IocPayload, IocReport, IocStatus, SubmitResult, ThreatLevel,
    TrustOutcome, TrustOutcomeEvent,
};
use crate::store::Store;
use crate::trust::TrustManager;

/// The consensus predicate. Critical indicators get a threshold relaxed by
/// one so a single highly trusted reporter can verify them; that fast path
/// requires mean trust at or above the bypass bar instead of the usual
/// average.
pub fn consensus_met(
    report_count: u32,
    mean_trust:   f64,
    threat_level: ThreatLevel,
    cfg:          &Config,
) -> bool {
    let required = if threat_level == ThreatLevel::Critical {
        cfg.consensus_threshold.saturating_sub(1).max(1)
    } else {
        cfg.consensus_threshold
    };
    if report_count < required {
        return false;
    }
    if threat_level == ThreatLevel::Critical && report_count < cfg.consensus_threshold {
        return mean_trust >= cfg.critical_trust_bypass;
    }
    mean_trust >= cfg.consensus_trust_avg
}

pub struct Aggregator {
    store:    Arc<Store>,
    trust:    Arc<TrustManager>,
    outcomes: mpsc::UnboundedSender<TrustOutcomeEvent>,
    cfg:      Config,
}

impl Aggregator {
    pub fn new(
        store: Arc<Store>,
        trust: Arc<TrustManager>,
        outcomes: mpsc::UnboundedSender<TrustOutcomeEvent>,
        cfg: Config,
    ) -> Self {
        Self { store, trust, outcomes, cfg }
    }

    /// Ingest one submission. Returns what happened to the row; the caller
    /// broadcasts when `newly_verified` is set.
    pub fn submit(&self, client_id: &str, payload: &IocPayload) -> Result<SubmitResult> {
        let now = Utc::now();
        let canonical = payload.ioc_type.canonicalize(&payload.value)?;
        let id = ioc_id(payload.ioc_type, &canonical);

        // Reporter trust snapshot; creates the row for unknown clients.
        let reporter_trust = self.trust.get(client_id)?.value;

        let _row = self.store.lock_row(&id);

        let existing = self.store.get_ioc(&id)?;
        let (mut ioc, created, counted) = match existing {
            None => {
                let ioc = Ioc {
                    id:           id.clone(),
                    ioc_type:     payload.ioc_type,
                    value:        canonical,
                    threat_level: payload.threat_level,
                    status:       IocStatus::Pending,
                    first_seen:   now,
                    last_seen:    now,
                    report_count: 1,
                    verified_at:  None,
                    metadata:     payload.metadata.clone(),
                };
                (ioc, true, true)
            }
            Some(mut ioc) => {
                let repeat = self.store.get_report(&id, client_id)?.is_some();
                ioc.last_seen = now;
                for (k, v) in &payload.metadata {
                    ioc.metadata.insert(k.clone(), v.clone());
                }
                if !repeat {
                    // report_count counts distinct reporters, never decremented
                    ioc.report_count += 1;
                }
                if ioc.status == IocStatus::Expired {
                    // A fresh sighting reopens the audit window; the row may
                    // verify again.
                    ioc.status = IocStatus::Pending;
                    ioc.verified_at = None;
                }
                (ioc, false, !repeat)
            }
        };

        let report = match self.store.get_report(&id, client_id)? {
            Some(mut r) => {
                r.last_seen = now;
                r
            }
            None => IocReport {
                ioc_id:                   id.clone(),
                client_id:                client_id.to_string(),
                reported_at:              now,
                last_seen:                now,
                reporter_trust_at_report: reporter_trust,
            },
        };

        // Re-submission by the same reporter never re-evaluates consensus.
        let mut newly_verified = false;
        let mut reporters: Vec<String> = Vec::new();
        if counted && ioc.status == IocStatus::Pending {
            reporters = self
                .store
                .reports_for(&id)?
                .into_iter()
                .map(|r| r.client_id)
                .collect();
            if !reporters.iter().any(|c| c == client_id) {
                reporters.push(client_id.to_string());
            }
            let mean = self.mean_trust(&reporters)?;
            if consensus_met(ioc.report_count, mean, ioc.threat_level, &self.cfg) {
                ioc.status = IocStatus::Verified;
                ioc.verified_at = Some(now);
                newly_verified = true;
            }
        }

        // Single commit point: row + report together. Promotion only exists
        // if this write succeeds.
        self.store.put_ioc_with_report(&ioc, &report)?;

        self.emit(client_id, TrustOutcome::Submitted);
        if newly_verified {
            info!(
                ioc = %ioc.id,
                kind = %ioc.ioc_type,
                reporters = ioc.report_count,
                "ioc verified"
            );
            for r in &reporters {
                self.emit(r, TrustOutcome::Accepted);
            }
        } else {
            debug!(ioc = %ioc.id, status = %ioc.status, created, "ioc submitted");
        }

        Ok(SubmitResult {
            ioc_id:  ioc.id,
            created,
            newly_verified,
            status:  ioc.status,
        })
    }

    pub fn get(&self, id: &str) -> Result<Ioc> {
        self.store.get_ioc(id)?.ok_or(CoordError::NotFound)
    }

    pub fn query(&self, filter: &IocFilter) -> Result<Vec<Ioc>> {
        // Status filter narrows via the index; anything else scans.
        let candidates = match filter.status {
            Some(status) => self.store.iocs_with_status(status)?,
            None         => self.store.all_iocs()?,
        };
        Ok(candidates.into_iter().filter(|i| filter.matches(i)).collect())
    }

    /// Provenance view: everything one client has reported, newest first.
    pub fn reported_by(&self, client_id: &str) -> Result<Vec<Ioc>> {
        self.store.iocs_reported_by(client_id)
    }

    /// Verified rows with `verified_at > cursor`, ascending, plus the cursor
    /// to hand back on the next call.
    pub fn pull_since(&self, cursor: i64) -> Result<(Vec<Ioc>, i64)> {
        let iocs = self.store.verified_since(cursor)?;
        let next = iocs
            .iter()
            .filter_map(|i| i.verified_at.map(|t| t.timestamp()))
            .max()
            .unwrap_or(cursor);
        Ok((iocs, next))
    }

    /// Initial snapshot for a client with no stored cursor.
    pub fn recent_verified(&self, limit: usize) -> Result<Vec<Ioc>> {
        self.store.recent_verified(limit)
    }

    /// Mark pending rows with no reports for ioc_ttl as expired and debit
    /// their reporters. Verified rows are left alone; only the explicit
    /// admin expire touches those.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<Vec<Ioc>> {
        let cutoff = now - Duration::seconds(self.cfg.ioc_ttl_secs);
        let stale = self.store.pending_older_than(cutoff)?;
        let mut expired = Vec::new();
        for candidate in stale {
            let _row = self.store.lock_row(&candidate.id);
            // Re-read under the lock; a late report may have verified it.
            let Some(mut ioc) = self.store.get_ioc(&candidate.id)? else { continue };
            if ioc.status != IocStatus::Pending || ioc.last_seen >= cutoff {
                continue;
            }
            ioc.status = IocStatus::Expired;
            self.store.put_ioc(&ioc)?;
            for report in self.store.reports_for(&ioc.id)? {
                self.emit(&report.client_id, TrustOutcome::Rejected);
            }
            info!(ioc = %ioc.id, last_seen = %ioc.last_seen, "ioc expired by sweep");
            expired.push(ioc);
        }
        Ok(expired)
    }

    /// Explicit admin expiry. The only path out of `verified`; reporters are
    /// debited only when the row never verified.
    pub fn expire(&self, id: &str, now: DateTime<Utc>) -> Result<Ioc> {
        let _row = self.store.lock_row(id);
        let mut ioc = self.store.get_ioc(id)?.ok_or(CoordError::NotFound)?;
        if ioc.status == IocStatus::Expired {
            return Err(CoordError::Conflict(format!("ioc {id} already expired")));
        }
        let was_verified = ioc.status == IocStatus::Verified;
        ioc.status = IocStatus::Expired;
        ioc.last_seen = now;
        self.store.put_ioc(&ioc)?;
        if !was_verified {
            for report in self.store.reports_for(id)? {
                self.emit(&report.client_id, TrustOutcome::Rejected);
            }
        }
        info!(ioc = %id, was_verified, "ioc expired by admin");
        Ok(ioc)
    }

    fn mean_trust(&self, reporters: &[String]) -> Result<f64> {
        if reporters.is_empty() {
            return Ok(0.0);
        }
        let mut sum = 0.0;
        for client in reporters {
            sum += self.trust.get(client)?.value;
        }
        Ok(sum / reporters.len() as f64)
    }

    fn emit(&self, client_id: &str, outcome: TrustOutcome) {
        let event = TrustOutcomeEvent { client_id: client_id.to_string(), outcome };
        if self.outcomes.send(event).is_err() {
            warn!(client = client_id, "trust outcome queue closed, credit dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn payload(t: crate::events::IocType, value: &str, level: ThreatLevel) -> IocPayload {
        IocPayload {
            ioc_type:     t,
            value:        value.to_string(),
            threat_level: level,
            metadata:     HashMap::new(),
        }
    }

    struct Rig {
        _dir:       tempfile::TempDir,
        trust:      Arc<TrustManager>,
        aggregator: Aggregator,
        outcomes:   mpsc::UnboundedReceiver<TrustOutcomeEvent>,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let trust = Arc::new(TrustManager::new(Arc::clone(&store), Config::default()).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(store, Arc::clone(&trust), tx, Config::default());
        Rig { _dir: dir, trust, aggregator, outcomes: rx }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TrustOutcomeEvent>) -> Vec<TrustOutcomeEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    // ── consensus_met boundaries ──────────────────────────────────────────────

    #[test]
    fn consensus_needs_both_count_and_trust() {
        let cfg = Config::default();
        // One short of the threshold, trust fine: no.
        assert!(!consensus_met(1, 0.9, ThreatLevel::High, &cfg));
        // At threshold, trust below the bar: no.
        assert!(!consensus_met(2, 0.59, ThreatLevel::High, &cfg));
        // Both hold: yes.
        assert!(consensus_met(2, 0.6, ThreatLevel::High, &cfg));
    }

    #[test]
    fn critical_single_reporter_needs_bypass_trust() {
        let cfg = Config::default();
        assert!(consensus_met(1, 0.85, ThreatLevel::Critical, &cfg));
        assert!(consensus_met(1, 0.8, ThreatLevel::Critical, &cfg));
        assert!(!consensus_met(1, 0.79, ThreatLevel::Critical, &cfg));
        // At the full threshold the normal average applies again.
        assert!(consensus_met(2, 0.6, ThreatLevel::Critical, &cfg));
    }

    #[test]
    fn critical_relaxation_never_drops_below_one_reporter() {
        let cfg = Config { consensus_threshold: 1, ..Config::default() };
        assert!(!consensus_met(0, 1.0, ThreatLevel::Critical, &cfg));
    }

    // ── Submit lifecycle ──────────────────────────────────────────────────────

    #[test]
    fn two_reporter_verification_credits_both() {
        // Scenario: A (0.7) and B (0.6) report the same hash.
        let mut r = rig();
        r.trust.adjust("agent-a", 0.7).unwrap();
        r.trust.adjust("agent-b", 0.6).unwrap();

        let p = payload(
            crate::events::IocType::FileHash,
            "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
            ThreatLevel::High,
        );
        let first = r.aggregator.submit("agent-a", &p).unwrap();
        assert_eq!(first.status, IocStatus::Pending);
        assert!(!first.newly_verified);
        assert!(first.created);

        let second = r.aggregator.submit("agent-b", &p).unwrap();
        assert_eq!(second.status, IocStatus::Verified);
        assert!(second.newly_verified);
        assert_eq!(second.ioc_id, first.ioc_id);

        let ioc = r.aggregator.get(&first.ioc_id).unwrap();
        assert_eq!(ioc.report_count, 2);
        assert!(ioc.verified_at.is_some());

        let credits: Vec<_> = drain(&mut r.outcomes)
            .into_iter()
            .filter(|e| e.outcome == TrustOutcome::Accepted)
            .map(|e| e.client_id)
            .collect();
        assert_eq!(credits.len(), 2);
        assert!(credits.contains(&"agent-a".to_string()));
        assert!(credits.contains(&"agent-b".to_string()));
    }

    #[test]
    fn critical_fast_path_verifies_immediately() {
        let mut r = rig();
        r.trust.adjust("agent-c", 0.85).unwrap();
        let p = payload(
            crate::events::IocType::Url,
            "http://bad.example/malware",
            ThreatLevel::Critical,
        );
        let res = r.aggregator.submit("agent-c", &p).unwrap();
        assert!(res.newly_verified);
        assert_eq!(res.status, IocStatus::Verified);
        let accepted = drain(&mut r.outcomes)
            .into_iter()
            .filter(|e| e.outcome == TrustOutcome::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn duplicate_submissions_stay_pending() {
        // Scenario: one client hammers the same IOC ten times.
        let mut r = rig();
        let p = payload(crate::events::IocType::Domain, "dup.example.com", ThreatLevel::High);
        let first = r.aggregator.submit("agent-d", &p).unwrap();
        for _ in 0..9 {
            let res = r.aggregator.submit("agent-d", &p).unwrap();
            assert!(!res.newly_verified);
            assert!(!res.created);
            assert_eq!(res.status, IocStatus::Pending);
        }
        let ioc = r.aggregator.get(&first.ioc_id).unwrap();
        assert_eq!(ioc.report_count, 1);
        assert!(drain(&mut r.outcomes).iter().all(|e| e.outcome == TrustOutcome::Submitted));
    }

    #[test]
    fn submit_is_idempotent_on_end_state() {
        let r = rig();
        let p = payload(crate::events::IocType::Domain, "Same.Example.COM", ThreatLevel::Low);
        r.aggregator.submit("agent-i", &p).unwrap();
        let before = r.aggregator.query(&IocFilter::default()).unwrap();
        r.aggregator.submit("agent-i", &p).unwrap();
        let after = r.aggregator.query(&IocFilter::default()).unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].report_count, after[0].report_count);
        assert_eq!(before[0].status, after[0].status);
    }

    #[test]
    fn low_trust_pair_does_not_verify() {
        let r = rig();
        r.trust.adjust("agent-x", 0.1).unwrap();
        r.trust.adjust("agent-y", 0.1).unwrap();
        let p = payload(crate::events::IocType::Domain, "meh.example.com", ThreatLevel::High);
        r.aggregator.submit("agent-x", &p).unwrap();
        let res = r.aggregator.submit("agent-y", &p).unwrap();
        assert!(!res.newly_verified);
        assert_eq!(res.status, IocStatus::Pending);
    }

    #[test]
    fn verification_fires_exactly_once() {
        let mut r = rig();
        r.trust.adjust("agent-a", 0.9).unwrap();
        r.trust.adjust("agent-b", 0.9).unwrap();
        r.trust.adjust("agent-c", 0.9).unwrap();
        let p = payload(crate::events::IocType::Domain, "once.example.com", ThreatLevel::High);
        r.aggregator.submit("agent-a", &p).unwrap();
        let verified: Vec<bool> = ["agent-b", "agent-c", "agent-a"]
            .iter()
            .map(|c| r.aggregator.submit(c, &p).unwrap().newly_verified)
            .collect();
        assert_eq!(verified.iter().filter(|v| **v).count(), 1);
        // Credits fired once per reporter of the verified row
        let accepted = drain(&mut r.outcomes)
            .into_iter()
            .filter(|e| e.outcome == TrustOutcome::Accepted)
            .count();
        assert_eq!(accepted, 2);
    }

    #[test]
    fn metadata_merges_last_writer_wins() {
        let r = rig();
        let mut p1 = payload(crate::events::IocType::Domain, "meta.example.com", ThreatLevel::Low);
        p1.metadata.insert("family".into(), "emotet".into());
        p1.metadata.insert("source".into(), "sandbox".into());
        let res = r.aggregator.submit("agent-1", &p1).unwrap();

        let mut p2 = p1.clone();
        p2.metadata.clear();
        p2.metadata.insert("family".into(), "qakbot".into());
        r.aggregator.submit("agent-2", &p2).unwrap();

        let ioc = r.aggregator.get(&res.ioc_id).unwrap();
        assert_eq!(ioc.metadata["family"], "qakbot");
        assert_eq!(ioc.metadata["source"], "sandbox");
    }

    #[test]
    fn malformed_payload_is_rejected_without_side_effects() {
        let r = rig();
        let p = payload(crate::events::IocType::FileHash, "not-a-digest", ThreatLevel::High);
        let err = r.aggregator.submit("agent-z", &p).unwrap_err();
        assert_eq!(err.kind(), "bad_request");
        assert!(r.aggregator.query(&IocFilter::default()).unwrap().is_empty());
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    #[test]
    fn sweep_expires_stale_pending_and_debits_reporter() {
        let mut r = rig();
        let p = payload(crate::events::IocType::Domain, "stale.example.com", ThreatLevel::Low);
        let res = r.aggregator.submit("agent-e", &p).unwrap();
        drain(&mut r.outcomes);

        let later = Utc::now() + Duration::seconds(Config::default().ioc_ttl_secs + 1);
        let expired = r.aggregator.expire_sweep(later).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, res.ioc_id);
        assert_eq!(r.aggregator.get(&res.ioc_id).unwrap().status, IocStatus::Expired);

        let rejected: Vec<_> = drain(&mut r.outcomes)
            .into_iter()
            .filter(|e| e.outcome == TrustOutcome::Rejected)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].client_id, "agent-e");
    }

    #[test]
    fn sweep_leaves_verified_rows_alone() {
        let r = rig();
        r.trust.adjust("agent-a", 0.9).unwrap();
        let p = payload(crate::events::IocType::Url, "http://keep.example/x", ThreatLevel::Critical);
        let res = r.aggregator.submit("agent-a", &p).unwrap();
        assert!(res.newly_verified);

        let later = Utc::now() + Duration::seconds(Config::default().ioc_ttl_secs * 2);
        let expired = r.aggregator.expire_sweep(later).unwrap();
        assert!(expired.is_empty());
        assert_eq!(r.aggregator.get(&res.ioc_id).unwrap().status, IocStatus::Verified);
    }

    #[test]
    fn admin_expire_conflicts_when_already_expired() {
        let mut r = rig();
        let p = payload(crate::events::IocType::Domain, "adm.example.com", ThreatLevel::Low);
        let res = r.aggregator.submit("agent-q", &p).unwrap();
        drain(&mut r.outcomes);

        let ioc = r.aggregator.expire(&res.ioc_id, Utc::now()).unwrap();
        assert_eq!(ioc.status, IocStatus::Expired);
        // Never-verified row debits its reporter
        assert!(drain(&mut r.outcomes)
            .iter()
            .any(|e| e.outcome == TrustOutcome::Rejected));

        let err = r.aggregator.expire(&res.ioc_id, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn admin_expire_of_verified_row_does_not_debit() {
        let mut r = rig();
        r.trust.adjust("agent-a", 0.9).unwrap();
        let p = payload(crate::events::IocType::Url, "http://done.example/y", ThreatLevel::Critical);
        let res = r.aggregator.submit("agent-a", &p).unwrap();
        drain(&mut r.outcomes);

        r.aggregator.expire(&res.ioc_id, Utc::now()).unwrap();
        assert!(drain(&mut r.outcomes)
            .iter()
            .all(|e| e.outcome != TrustOutcome::Rejected));
    }

    #[test]
    fn re_report_after_expiry_reopens_the_audit_window() {
        let mut r = rig();
        r.trust.adjust("agent-a", 0.9).unwrap();
        r.trust.adjust("agent-b", 0.9).unwrap();
        let p = payload(crate::events::IocType::Domain, "back.example.com", ThreatLevel::High);
        let res = r.aggregator.submit("agent-a", &p).unwrap();
        r.aggregator.expire(&res.ioc_id, Utc::now()).unwrap();
        drain(&mut r.outcomes);

        // New sighting revives the row, and consensus may fire a second
        // verification for the fresh window.
        let revived = r.aggregator.submit("agent-b", &p).unwrap();
        assert!(revived.newly_verified);
        assert_eq!(revived.status, IocStatus::Verified);
    }

    // ── Pull sync ─────────────────────────────────────────────────────────────

    #[test]
    fn pull_since_returns_ascending_and_advances_cursor() {
        let r = rig();
        r.trust.adjust("agent-a", 0.9).unwrap();
        for value in ["http://one.example/a", "http://two.example/b"] {
            let p = payload(crate::events::IocType::Url, value, ThreatLevel::Critical);
            r.aggregator.submit("agent-a", &p).unwrap();
        }
        let (iocs, cursor) = r.aggregator.pull_since(0).unwrap();
        assert_eq!(iocs.len(), 2);
        assert!(iocs.windows(2).all(|w| w[0].verified_at <= w[1].verified_at));
        assert!(cursor > 0);

        let (rest, cursor2) = r.aggregator.pull_since(cursor).unwrap();
        assert!(rest.is_empty());
        assert_eq!(cursor2, cursor);
    }
}
