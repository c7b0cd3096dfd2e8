// intelmesh/src/fabric/mod.rs
//
// Real-time distribution fabric: the registry of live agent sessions and
// the event bus that fans verified intelligence back out to them.
//
// Each session owns a bounded outbound queue drained by one writer task.
// Overflow policy: the oldest droppable frame (client_status) goes first;
// verified-IOC frames are never dropped. If nothing can be evicted the
// session is closed and the agent re-syncs on reconnect, so a slow consumer
// can fall behind but can never silently lose intelligence.

pub mod protocol;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;
use crate::events::ClientProfile;
use crate::fabric::protocol::{read_frame, write_frame, ClientFrame, ServerFrame};

// ── Session ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    DroppedOldest,   // an old client_status was evicted to admit this frame
    DroppedNew,      // this frame itself was droppable and the queue is full
    Closed,          // undroppable frame, nothing evictable: session closed
}

pub struct Session {
    pub client_id: String,
    queue:    Mutex<VecDeque<ServerFrame>>,
    notify:   Notify,
    closed:   AtomicBool,
    capacity: usize,
    pub dropped_frames: AtomicU64,
}

impl Session {
    pub fn new(client_id: &str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.to_string(),
            queue:     Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify:    Notify::new(),
            closed:    AtomicBool::new(false),
            capacity,
            dropped_frames: AtomicU64::new(0),
        })
    }

    /// Admit one outbound frame under the overflow policy.
    pub fn enqueue(&self, frame: ServerFrame) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        let mut q = self.queue.lock();
        if q.len() < self.capacity {
            q.push_back(frame);
            drop(q);
            self.notify.notify_one();
            return Enqueue::Queued;
        }

        // Full: evict the oldest droppable frame first.
        if let Some(idx) = q.iter().position(|f| f.droppable()) {
            q.remove(idx);
            q.push_back(frame);
            drop(q);
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
            return Enqueue::DroppedOldest;
        }

        if frame.droppable() {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            return Enqueue::DroppedNew;
        }

        // Queue full of must-deliver frames and another one arrived: the
        // consumer is too slow to keep, close it and let it re-sync.
        drop(q);
        self.close();
        Enqueue::Closed
    }

    pub fn drain(&self) -> Vec<ServerFrame> {
        self.queue.lock().drain(..).collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn wait_outbound(&self) {
        self.notify.notified().await;
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub profile:      ClientProfile,
    pub online:       bool,
    pub connected_at: DateTime<Utc>,
}

pub struct Fabric {
    sessions:   DashMap<String, Arc<Session>>,
    clients:    DashMap<String, ClientEntry>,
    cursors:    DashMap<String, i64>,   // preserved across disconnects
    queue_size: usize,
}

impl Fabric {
    pub fn new(queue_size: usize) -> Self {
        Self {
            sessions:   DashMap::new(),
            clients:    DashMap::new(),
            cursors:    DashMap::new(),
            queue_size,
        }
    }

    /// Register (or re-register) a client. A lingering session under the
    /// same id is closed; the newcomer wins.
    pub fn register(&self, profile: ClientProfile) -> Arc<Session> {
        let session = Session::new(&profile.client_id, self.queue_size);
        if let Some(old) = self.sessions.insert(profile.client_id.clone(), Arc::clone(&session)) {
            old.close();
        }
        self.clients.insert(
            profile.client_id.clone(),
            ClientEntry { profile, online: true, connected_at: Utc::now() },
        );
        session
    }

    /// Mark offline and tear the session down. The sync cursor survives so
    /// the next connect resumes where this one left off.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let had_session = match self.sessions.remove(client_id) {
            Some((_, session)) => {
                session.close();
                true
            }
            None => false,
        };
        if let Some(mut entry) = self.clients.get_mut(client_id) {
            entry.online = false;
        }
        had_session
    }

    /// Fan one frame out to every live subscriber. Sessions whose queues
    /// cannot admit an undroppable frame are closed and reported back.
    pub fn broadcast(&self, frame: &ServerFrame) -> Vec<String> {
        let mut closed = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().enqueue(frame.clone()) == Enqueue::Closed {
                closed.push(entry.key().clone());
            }
        }
        for client_id in &closed {
            warn!(client = %client_id, "outbound queue overflow, session closed");
            self.disconnect(client_id);
        }
        closed
    }

    pub fn cursor(&self, client_id: &str) -> Option<i64> {
        self.cursors.get(client_id).map(|c| *c)
    }

    pub fn set_cursor(&self, client_id: &str, cursor: i64) {
        self.cursors.insert(client_id.to_string(), cursor);
    }

    pub fn online_ids(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|e| e.value().online)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.clients.iter().filter(|e| e.value().online).count()
    }

    pub fn entry(&self, client_id: &str) -> Option<ClientEntry> {
        self.clients.get(client_id).map(|e| e.value().clone())
    }
}

// ── Event-channel server ──────────────────────────────────────────────────────

pub struct EventServer {
    coordinator: Arc<Coordinator>,
    addr:        SocketAddr,
}

impl EventServer {
    pub fn new(coordinator: Arc<Coordinator>, addr: SocketAddr) -> Self {
        Self { coordinator, addr }
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("event channel listening on {}", self.addr);
        loop {
            let (stream, peer) = listener.accept().await?;
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(e) = handle_conn(coordinator, stream).await {
                    warn!("event session error from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_conn(coordinator: Arc<Coordinator>, stream: TcpStream) -> Result<()> {
    let (mut rd, mut wr) = stream.into_split();

    // The first frame must identify the client.
    let profile = match read_frame::<_, ClientFrame>(&mut rd).await? {
        Some(ClientFrame::Register { client_id, hostname, version }) => {
            ClientProfile { client_id, hostname, version }
        }
        Some(other) => {
            anyhow::bail!("expected register, got {:?}", other);
        }
        None => return Ok(()),
    };
    let client_id = profile.client_id.clone();
    let session = coordinator.handle_register(profile)?;

    // Writer: drains the session queue until the session closes. Aborted on
    // disconnect so in-flight deliveries stop immediately.
    let writer_session = Arc::clone(&session);
    let writer = tokio::spawn(async move {
        loop {
            let batch = writer_session.drain();
            if batch.is_empty() {
                if writer_session.is_closed() {
                    break;
                }
                writer_session.wait_outbound().await;
                continue;
            }
            for frame in &batch {
                if write_frame(&mut wr, frame).await.is_err() {
                    writer_session.close();
                    return;
                }
            }
        }
    });

    // Reader: one inbound event at a time, processed to completion before
    // its acknowledgement; different sessions run in parallel.
    loop {
        if session.is_closed() {
            break;
        }
        match read_frame::<_, ClientFrame>(&mut rd).await {
            Ok(Some(frame)) => {
                debug!(client = %client_id, ?frame, "inbound event");
                if !coordinator.handle_frame(&session, frame).await {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(client = %client_id, error = %e, "bad inbound frame");
                break;
            }
        }
    }

    coordinator.handle_disconnect(&client_id);
    writer.abort();
    Ok(())
}
