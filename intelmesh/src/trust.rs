// intelmesh/src/trust.rs
//
// Per-client reputation engine. Four weighted factors drive the score:
//   accuracy        — accepted / (accepted + rejected)
//   contribution    — report volume, saturating at contribution_norm
//   responsiveness  — exp(-Δheartbeat / tau)
//   consistency     — 1 − stddev(last K outcomes)
// New evidence is blended in at learning rate alpha; idle clients decay
// toward initial_trust by decay_rate per interval, with decay_rate^N
// catch-up so lazy and scheduled decay agree.
//
// Mutations are serialized per client behind the row lock; the sled row is
// written before the in-memory state is considered committed, and reverted
// if the write fails.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::events::{TrustEvent, TrustOutcome, TrustReason, TrustScore};
use crate::store::Store;

pub struct TrustManager {
    store:   Arc<Store>,
    cfg:     Config,
    clients: DashMap<String, Arc<RwLock<TrustScore>>>,
}

impl TrustManager {
    pub fn new(store: Arc<Store>, cfg: Config) -> Result<Self> {
        let clients = DashMap::new();
        for score in store.snapshot_trust()? {
            clients.insert(score.client_id.clone(), Arc::new(RwLock::new(score)));
        }
        Ok(Self { store, cfg, clients })
    }

    fn row(&self, client_id: &str) -> Arc<RwLock<TrustScore>> {
        self.clients
            .entry(client_id.to_string())
            .or_insert_with(|| {
                Arc::new(RwLock::new(TrustScore::new(
                    client_id,
                    self.cfg.initial_trust,
                    Utc::now(),
                )))
            })
            .clone()
    }

    /// Current score with lazy decay applied. Unknown clients are created at
    /// initial_trust; a malformed id is just another opaque id.
    pub fn get(&self, client_id: &str) -> Result<TrustScore> {
        self.get_at(client_id, Utc::now())
    }

    pub fn get_at(&self, client_id: &str, now: DateTime<Utc>) -> Result<TrustScore> {
        let row = self.row(client_id);
        let mut guard = row.write();
        let before = guard.clone();
        let intervals = decay_in_place(&mut guard, now, &self.cfg);
        if let Err(e) = self.store.put_trust(&guard) {
            *guard = before;
            return Err(e);
        }
        if intervals > 0 {
            let delta = guard.value - before.value;
            self.log_event(client_id, now, delta, TrustReason::Decay);
        }
        Ok(guard.clone())
    }

    /// Apply one report outcome: bump counters, re-run the weighted formula,
    /// blend at the learning rate, clamp, persist, audit.
    pub fn update_on_report(&self, client_id: &str, outcome: TrustOutcome) -> Result<TrustScore> {
        let now = Utc::now();
        let row = self.row(client_id);
        let mut guard = row.write();
        let before = guard.clone();

        decay_in_place(&mut guard, now, &self.cfg);

        match outcome {
            TrustOutcome::Submitted => {
                guard.reports_total += 1;
            }
            TrustOutcome::Accepted => {
                guard.reports_accepted += 1;
                push_outcome(&mut guard, 1, self.cfg.consistency_window);
            }
            TrustOutcome::Rejected => {
                guard.reports_rejected += 1;
                push_outcome(&mut guard, 0, self.cfg.consistency_window);
            }
        }

        let raw = weighted_score(&guard, now, &self.cfg);
        let blended = self.cfg.alpha * raw + (1.0 - self.cfg.alpha) * guard.value;
        guard.value = blended.clamp(self.cfg.min_trust, self.cfg.max_trust);
        guard.last_updated_at = now;

        if let Err(e) = self.store.put_trust(&guard) {
            *guard = before;
            return Err(e);
        }

        let delta  = guard.value - before.value;
        let reason = match outcome {
            TrustOutcome::Submitted => TrustReason::Report,
            TrustOutcome::Accepted  => TrustReason::Accepted,
            TrustOutcome::Rejected  => TrustReason::Rejected,
        };
        self.log_event(client_id, now, delta, reason);
        debug!(client = client_id, value = guard.value, ?outcome, "trust updated");
        Ok(guard.clone())
    }

    /// Admin override: pin a client's score. Audited with reason `manual`.
    pub fn adjust(&self, client_id: &str, value: f64) -> Result<TrustScore> {
        let now = Utc::now();
        let row = self.row(client_id);
        let mut guard = row.write();
        let before = guard.clone();
        guard.value = value.clamp(self.cfg.min_trust, self.cfg.max_trust);
        guard.last_updated_at = now;
        if let Err(e) = self.store.put_trust(&guard) {
            *guard = before;
            return Err(e);
        }
        self.log_event(client_id, now, guard.value - before.value, TrustReason::Manual);
        Ok(guard.clone())
    }

    /// Read without creating: probing an unknown id from a display path
    /// never mints a trust row. Decay is applied to the returned copy only.
    pub fn lookup(&self, client_id: &str) -> Option<TrustScore> {
        let row = self.clients.get(client_id)?.clone();
        let mut score = row.read().clone();
        decay_in_place(&mut score, Utc::now(), &self.cfg);
        Some(score)
    }

    /// Heartbeats feed the responsiveness factor only.
    pub fn register_heartbeat(&self, client_id: &str, at: DateTime<Utc>) -> Result<()> {
        let row = self.row(client_id);
        let mut guard = row.write();
        let before = guard.last_heartbeat_at;
        guard.last_heartbeat_at = Some(at);
        if let Err(e) = self.store.put_trust(&guard) {
            guard.last_heartbeat_at = before;
            return Err(e);
        }
        Ok(())
    }

    pub fn last_heartbeat(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.clients.get(client_id).and_then(|r| r.read().last_heartbeat_at)
    }

    /// Scheduled decay pass. Lazy reads already catch up, so this exists to
    /// keep persisted rows fresh for dashboards even when nobody reads them.
    pub fn apply_decay_tick(&self, now: DateTime<Utc>) {
        let ids: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.get_at(&id, now) {
                warn!(client = %id, error = %e, "decay tick skipped");
            }
        }
    }

    pub async fn decay_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.cfg.decay_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            self.apply_decay_tick(Utc::now());
        }
    }

    /// O(N) read of every score, for dashboards and /status aggregation.
    pub fn snapshot(&self) -> HashMap<String, TrustScore> {
        self.clients
            .iter()
            .map(|e| (e.key().clone(), e.value().read().clone()))
            .collect()
    }

    fn log_event(&self, client_id: &str, at: DateTime<Utc>, delta: f64, reason: TrustReason) {
        let event = TrustEvent { client_id: client_id.to_string(), at, delta, reason };
        // Best-effort audit; a lost event never blocks the score update.
        if let Err(e) = self.store.append_trust_event(&event) {
            warn!(client = client_id, error = %e, "trust event not persisted");
        }
    }
}

// ── Scoring math ──────────────────────────────────────────────────────────────

fn push_outcome(score: &mut TrustScore, outcome: u8, window: usize) {
    score.outcome_history.push_back(outcome);
    while score.outcome_history.len() > window {
        score.outcome_history.pop_front();
    }
}

fn weighted_score(score: &TrustScore, now: DateTime<Utc>, cfg: &Config) -> f64 {
    let judged   = (score.reports_accepted + score.reports_rejected).max(1) as f64;
    let accuracy = score.reports_accepted as f64 / judged;

    let contribution = (score.reports_total as f64 / cfg.contribution_norm).min(1.0);

    let responsiveness = match score.last_heartbeat_at {
        Some(hb) => {
            let dt = (now - hb).num_seconds().max(0) as f64;
            (-dt / cfg.responsiveness_tau_secs).exp()
        }
        None => 0.0,
    };

    let consistency = (1.0 - outcome_stddev(&score.outcome_history)).clamp(0.0, 1.0);

    cfg.w_accuracy * accuracy
        + cfg.w_contribution * contribution
        + cfg.w_responsiveness * responsiveness
        + cfg.w_consistency * consistency
}

fn outcome_stddev(history: &std::collections::VecDeque<u8>) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let n    = history.len() as f64;
    let mean = history.iter().map(|&o| o as f64).sum::<f64>() / n;
    let var  = history.iter().map(|&o| (o as f64 - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

/// Advance the score toward initial_trust by decay_rate per elapsed interval.
/// Returns the number of intervals applied; `last_updated_at` moves in whole
/// intervals so repeated calls are idempotent.
fn decay_in_place(score: &mut TrustScore, now: DateTime<Utc>, cfg: &Config) -> u32 {
    let interval = cfg.decay_interval_secs as i64;
    if interval <= 0 {
        return 0;
    }
    let elapsed = (now - score.last_updated_at).num_seconds();
    if elapsed < interval {
        return 0;
    }
    let n = (elapsed / interval) as u32;
    let factor = cfg.decay_rate.powi(n as i32);
    score.value = cfg.initial_trust + (score.value - cfg.initial_trust) * factor;
    score.value = score.value.clamp(cfg.min_trust, cfg.max_trust);
    score.last_updated_at = score.last_updated_at + Duration::seconds(n as i64 * interval);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, TrustManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mgr = TrustManager::new(store, Config::default()).unwrap();
        (dir, mgr)
    }

    #[test]
    fn unknown_client_starts_at_initial_trust() {
        let (_dir, mgr) = manager();
        let score = mgr.get("fresh-agent").unwrap();
        assert_eq!(score.value, 0.5);
        assert_eq!(score.reports_total, 0);
    }

    #[test]
    fn decay_catchup_matches_closed_form() {
        // Trust 0.9, idle for 3 intervals: 0.5 + 0.4 * 0.95^3
        let (_dir, mgr) = manager();
        let cfg = Config::default();
        let t0 = Utc::now();

        let row = mgr.row("agent-f");
        {
            let mut g = row.write();
            g.value = 0.9;
            g.last_updated_at = t0;
        }
        let later = t0 + Duration::seconds(3 * cfg.decay_interval_secs as i64);
        let score = mgr.get_at("agent-f", later).unwrap();
        let expected = 0.5 + (0.9 - 0.5) * 0.95f64.powi(3);
        assert!((score.value - expected).abs() < 1e-6, "got {}", score.value);

        // Re-reading at the same instant applies nothing further
        let again = mgr.get_at("agent-f", later).unwrap();
        assert!((again.value - expected).abs() < 1e-6);
    }

    #[test]
    fn partial_interval_does_not_decay() {
        let (_dir, mgr) = manager();
        let t0 = Utc::now();
        let row = mgr.row("agent-g");
        {
            let mut g = row.write();
            g.value = 0.9;
            g.last_updated_at = t0;
        }
        let score = mgr.get_at("agent-g", t0 + Duration::seconds(300)).unwrap();
        assert_eq!(score.value, 0.9);
    }

    #[test]
    fn lookup_never_creates_a_row() {
        let (_dir, mgr) = manager();
        assert!(mgr.lookup("agent-ghost").is_none());
        assert!(mgr.snapshot().is_empty());

        mgr.update_on_report("agent-real", TrustOutcome::Submitted).unwrap();
        let score = mgr.lookup("agent-real").unwrap();
        assert_eq!(score.reports_total, 1);
    }

    #[test]
    fn rejections_trend_toward_floor_but_never_below() {
        let (_dir, mgr) = manager();
        for _ in 0..10 {
            mgr.update_on_report("agent-bad", TrustOutcome::Rejected).unwrap();
        }
        let score = mgr.get("agent-bad").unwrap();
        assert!(score.value >= 0.1, "floor violated: {}", score.value);
        assert!(score.value < 0.5, "rejections must lower trust: {}", score.value);
        assert_eq!(score.reports_rejected, 10);
    }

    #[test]
    fn accepted_reports_raise_trust_within_bounds() {
        let (_dir, mgr) = manager();
        mgr.register_heartbeat("agent-good", Utc::now()).unwrap();
        let mut last = mgr.get("agent-good").unwrap().value;
        for _ in 0..30 {
            mgr.update_on_report("agent-good", TrustOutcome::Submitted).unwrap();
            let s = mgr.update_on_report("agent-good", TrustOutcome::Accepted).unwrap();
            assert!(s.value <= 1.0);
            last = s.value;
        }
        assert!(last > 0.5, "steady accepted reports should exceed initial: {last}");
    }

    #[test]
    fn outcome_history_is_bounded() {
        let (_dir, mgr) = manager();
        for _ in 0..50 {
            mgr.update_on_report("agent-k", TrustOutcome::Accepted).unwrap();
        }
        let score = mgr.get("agent-k").unwrap();
        assert_eq!(score.outcome_history.len(), Config::default().consistency_window);
    }

    #[test]
    fn trust_events_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mgr = TrustManager::new(Arc::clone(&store), Config::default()).unwrap();
        mgr.update_on_report("agent-e", TrustOutcome::Submitted).unwrap();
        mgr.update_on_report("agent-e", TrustOutcome::Accepted).unwrap();
        let events = store.trust_events_for("agent-e", 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].reason, TrustReason::Report);
        assert_eq!(events[1].reason, TrustReason::Accepted);
    }

    #[test]
    fn manual_adjust_is_clamped_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mgr = TrustManager::new(Arc::clone(&store), Config::default()).unwrap();
        let s = mgr.adjust("agent-m", 5.0).unwrap();
        assert_eq!(s.value, 1.0);
        let events = store.trust_events_for("agent-m", 10).unwrap();
        assert_eq!(events.last().unwrap().reason, TrustReason::Manual);
    }

    #[test]
    fn scores_reload_from_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Arc::new(Store::open(dir.path()).unwrap());
            let mgr = TrustManager::new(Arc::clone(&store), Config::default()).unwrap();
            mgr.update_on_report("agent-p", TrustOutcome::Accepted).unwrap();
            store.flush().unwrap();
        }
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let mgr = TrustManager::new(store, Config::default()).unwrap();
        let snap = mgr.snapshot();
        assert!(snap.contains_key("agent-p"));
        assert_eq!(snap["agent-p"].reports_accepted, 1);
    }
}
