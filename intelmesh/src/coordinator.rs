// intelmesh/src/coordinator.rs
//
// Thin facade binding the store, trust manager, aggregator, and fabric.
// Inbound events (channel frames or HTTP calls) are translated into
// component calls here; verification results fan back out through the
// fabric and land in the JSONL audit log.
//
// The facade also owns every background loop: the trust-outcome queue
// consumer, decay, the expire sweep, and the heartbeat reaper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::error::{CoordError, Result};
use crate::events::{ClientProfile, Ioc, IocPayload, SubmitResult, TrustOutcomeEvent};
use crate::fabric::protocol::{ClientFrame, ServerFrame};
use crate::fabric::{Fabric, Session};
use crate::store::Store;
use crate::trust::TrustManager;

pub struct Coordinator {
    pub cfg:        Config,
    pub store:      Arc<Store>,
    pub trust:      Arc<TrustManager>,
    pub aggregator: Arc<Aggregator>,
    pub fabric:     Arc<Fabric>,
    audit_path:     PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total_clients:  usize,
    pub online_clients: usize,
    pub total_iocs:     u64,
    pub verified_iocs:  u64,
    pub average_trust:  f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub client_id: String,
    pub hostname:  Option<String>,
    pub version:   Option<String>,
    pub online:    bool,
    pub trust:     f64,
}

/// One client's full picture: identity, reputation, and everything it has
/// reported (newest first).
#[derive(Debug, Clone, Serialize)]
pub struct ClientDetail {
    pub client_id:         String,
    pub hostname:          Option<String>,
    pub version:           Option<String>,
    pub online:            bool,
    pub trust:             f64,
    pub reports_total:     u64,
    pub reports_accepted:  u64,
    pub reports_rejected:  u64,
    pub reported_iocs:     Vec<Ioc>,
}

impl Coordinator {
    pub fn new(
        cfg: Config,
        data_dir: &Path,
    ) -> anyhow::Result<(Arc<Self>, mpsc::UnboundedReceiver<TrustOutcomeEvent>)> {
        std::fs::create_dir_all(data_dir)?;
        let store = Arc::new(Store::open(&data_dir.join("db"))?);
        let trust = Arc::new(TrustManager::new(Arc::clone(&store), cfg.clone())?);
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            Arc::clone(&trust),
            tx,
            cfg.clone(),
        ));
        let fabric = Arc::new(Fabric::new(cfg.outbound_queue_size));
        let coordinator = Arc::new(Self {
            cfg,
            store,
            trust,
            aggregator,
            fabric,
            audit_path: data_dir.join("audit_log.jsonl"),
        });
        Ok((coordinator, rx))
    }

    /// Spawn the outcome consumer and all periodic tasks.
    pub fn spawn_background(self: &Arc<Self>, outcomes: mpsc::UnboundedReceiver<TrustOutcomeEvent>) {
        tokio::spawn(Arc::clone(self).outcome_loop(outcomes));
        tokio::spawn(Arc::clone(&self.trust).decay_loop());
        tokio::spawn(Arc::clone(self).sweep_loop());
        tokio::spawn(Arc::clone(self).reaper_loop());
    }

    // ── Inbound events ────────────────────────────────────────────────────────

    /// connect: register the session, count a heartbeat, broadcast presence,
    /// and hand the newcomer its catch-up snapshot.
    pub fn handle_register(&self, profile: ClientProfile) -> Result<Arc<Session>> {
        let client_id = profile.client_id.clone();
        let session = self.fabric.register(profile);
        self.trust.register_heartbeat(&client_id, Utc::now())?;
        let trust = self.trust.get(&client_id)?.value;
        info!(client = %client_id, trust, "client connected");

        self.fabric.broadcast(&ServerFrame::ClientStatus {
            client_id: client_id.clone(),
            online:    true,
            trust,
        });

        // Initial snapshot: resume from the stored cursor when we have one,
        // otherwise the most recent verified rows.
        let (iocs, cursor) = match self.fabric.cursor(&client_id) {
            Some(cursor) => self.aggregator.pull_since(cursor)?,
            None => {
                let iocs = self.aggregator.recent_verified(self.cfg.snapshot_limit)?;
                let cursor = iocs
                    .iter()
                    .filter_map(|i| i.verified_at.map(|t| t.timestamp()))
                    .max()
                    .unwrap_or(0);
                (iocs, cursor)
            }
        };
        self.fabric.set_cursor(&client_id, cursor);
        session.enqueue(ServerFrame::SyncResponse { iocs, cursor });
        Ok(session)
    }

    /// Dispatch one channel frame. Returns false when the session should end.
    pub async fn handle_frame(&self, session: &Arc<Session>, frame: ClientFrame) -> bool {
        match frame {
            ClientFrame::Register { client_id, .. } => {
                warn!(client = %client_id, "duplicate register on live session ignored");
                true
            }
            ClientFrame::Heartbeat { client_id, at } => {
                if let Err(e) = self.trust.register_heartbeat(&client_id, at) {
                    warn!(client = %client_id, error = %e, "heartbeat not recorded");
                }
                true
            }
            ClientFrame::ReportThreat { client_id, ioc } => {
                match self.handle_report(&client_id, ioc).await {
                    Ok(result) => {
                        session.enqueue(ServerFrame::ReportAck {
                            ioc_id: result.ioc_id,
                            status: result.status,
                        });
                    }
                    Err(e) => {
                        session.enqueue(ServerFrame::ReportNack { reason: e.kind().to_string() });
                    }
                }
                true
            }
            ClientFrame::SyncRequest { client_id, cursor } => {
                match self.handle_sync(&client_id, cursor) {
                    Ok((iocs, cursor)) => {
                        session.enqueue(ServerFrame::SyncResponse { iocs, cursor });
                    }
                    Err(e) => {
                        warn!(client = %client_id, error = %e, "sync failed");
                        session.enqueue(ServerFrame::ReportNack { reason: e.kind().to_string() });
                    }
                }
                true
            }
            ClientFrame::Disconnect { .. } => false,
        }
    }

    /// Submission entry point shared by the event channel and HTTP. The
    /// whole submit runs under the handler deadline; promotion broadcasts
    /// before the result is returned to the sender.
    pub async fn handle_report(&self, client_id: &str, payload: IocPayload) -> Result<SubmitResult> {
        let aggregator = Arc::clone(&self.aggregator);
        let cid = client_id.to_string();
        let deadline = Duration::from_secs(self.cfg.handler_timeout_secs);

        let result = tokio::time::timeout(
            deadline,
            tokio::task::spawn_blocking(move || aggregator.submit(&cid, &payload)),
        )
        .await
        .map_err(|_| CoordError::Timeout)?
        .map_err(|e| CoordError::Internal(format!("submit task: {e}")))??;

        if result.newly_verified {
            let ioc = self.aggregator.get(&result.ioc_id)?;
            self.publish_verified(&ioc).await;
        }
        Ok(result)
    }

    pub fn handle_sync(&self, client_id: &str, cursor: i64) -> Result<(Vec<Ioc>, i64)> {
        let (iocs, next) = self.aggregator.pull_since(cursor)?;
        self.fabric.set_cursor(client_id, next);
        Ok((iocs, next))
    }

    pub fn handle_disconnect(&self, client_id: &str) {
        if self.fabric.disconnect(client_id) {
            info!(client = %client_id, "client disconnected");
            let trust = self.trust.get(client_id).map(|t| t.value).unwrap_or(0.0);
            self.fabric.broadcast(&ServerFrame::ClientStatus {
                client_id: client_id.to_string(),
                online:    false,
                trust,
            });
        }
    }

    /// Admin expiry, surfaced over HTTP.
    pub async fn handle_expire(&self, ioc_id: &str) -> Result<Ioc> {
        let ioc = self.aggregator.expire(ioc_id, Utc::now())?;
        self.audit(serde_json::json!({
            "record": "ioc_expired",
            "ioc_id": ioc.id,
            "by":     "admin",
            "at":     Utc::now(),
        }))
        .await;
        Ok(ioc)
    }

    async fn publish_verified(&self, ioc: &Ioc) {
        self.fabric.broadcast(&ServerFrame::IocVerified { ioc: ioc.clone() });
        self.audit(serde_json::json!({
            "record":       "ioc_verified",
            "ioc_id":       ioc.id,
            "type":         ioc.ioc_type,
            "threat_level": ioc.threat_level,
            "report_count": ioc.report_count,
            "at":           ioc.verified_at,
        }))
        .await;
    }

    // ── Read-side aggregation ─────────────────────────────────────────────────

    pub fn status(&self) -> StatusSummary {
        let snapshot = self.trust.snapshot();
        let average_trust = if snapshot.is_empty() {
            0.0
        } else {
            snapshot.values().map(|s| s.value).sum::<f64>() / snapshot.len() as f64
        };
        StatusSummary {
            total_clients:  snapshot.len(),
            online_clients: self.fabric.online_count(),
            total_iocs:     self.store.total_iocs.load(std::sync::atomic::Ordering::Relaxed),
            verified_iocs:  self.store.verified_iocs.load(std::sync::atomic::Ordering::Relaxed),
            average_trust,
        }
    }

    /// Per-client drill-down for `/clients/{id}`. Unknown ids are a
    /// `not_found`, not a fresh trust row.
    pub fn client_detail(&self, client_id: &str) -> Result<ClientDetail> {
        let score = self.trust.lookup(client_id).ok_or(CoordError::NotFound)?;
        let entry = self.fabric.entry(client_id);
        Ok(ClientDetail {
            client_id:        score.client_id,
            hostname:         entry.as_ref().map(|e| e.profile.hostname.clone()),
            version:          entry.as_ref().map(|e| e.profile.version.clone()),
            online:           entry.map(|e| e.online).unwrap_or(false),
            trust:            score.value,
            reports_total:    score.reports_total,
            reports_accepted: score.reports_accepted,
            reports_rejected: score.reports_rejected,
            reported_iocs:    self.aggregator.reported_by(client_id)?,
        })
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        let snapshot = self.trust.snapshot();
        snapshot
            .into_iter()
            .map(|(client_id, score)| {
                let entry = self.fabric.entry(&client_id);
                ClientSummary {
                    hostname: entry.as_ref().map(|e| e.profile.hostname.clone()),
                    version:  entry.as_ref().map(|e| e.profile.version.clone()),
                    online:   entry.map(|e| e.online).unwrap_or(false),
                    trust:    score.value,
                    client_id,
                }
            })
            .collect()
    }

    // ── Background loops ──────────────────────────────────────────────────────

    /// Drain aggregator outcome events into the trust manager. Credits for a
    /// just-verified IOC are best-effort: bounded retries, then log and move
    /// on; the verification itself is never reverted.
    async fn outcome_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<TrustOutcomeEvent>) {
        while let Some(event) = rx.recv().await {
            let mut attempts = 0;
            loop {
                match self.trust.update_on_report(&event.client_id, event.outcome) {
                    Ok(_) => break,
                    Err(e) if attempts < 2 => {
                        attempts += 1;
                        warn!(client = %event.client_id, error = %e, attempts, "trust update retry");
                        tokio::time::sleep(Duration::from_millis(50 << attempts)).await;
                    }
                    Err(e) => {
                        error!(client = %event.client_id, error = %e, "trust update dropped");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.expire_sweep_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            match self.aggregator.expire_sweep(Utc::now()) {
                Ok(expired) => {
                    for ioc in expired {
                        self.audit(serde_json::json!({
                            "record": "ioc_expired",
                            "ioc_id": ioc.id,
                            "by":     "sweep",
                            "at":     Utc::now(),
                        }))
                        .await;
                    }
                }
                Err(e) => error!(error = %e, "expire sweep failed"),
            }
        }
    }

    /// Mark clients offline once they miss three heartbeat intervals.
    async fn reaper_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.cfg.reaper_interval_secs);
        let limit = chrono::Duration::seconds(3 * self.cfg.heartbeat_interval_secs as i64);
        loop {
            tokio::time::sleep(interval).await;
            let now = Utc::now();
            for client_id in self.fabric.online_ids() {
                let last = self
                    .trust
                    .last_heartbeat(&client_id)
                    .or_else(|| self.fabric.entry(&client_id).map(|e| e.connected_at));
                let stale = match last {
                    Some(at) => now - at > limit,
                    None     => true,
                };
                if stale {
                    info!(client = %client_id, "heartbeat lapsed, marking offline");
                    self.handle_disconnect(&client_id);
                }
            }
        }
    }

    async fn audit(&self, record: serde_json::Value) {
        let line = record.to_string() + "\n";
        let open = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await;
        match open {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!(error = %e, "audit append failed");
                }
            }
            Err(e) => warn!(error = %e, "audit log unavailable"),
        }
    }
}
