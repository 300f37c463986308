//! Per-remote-member replication controller.
//!
//! Each peer runs one heartbeat task while the local server leads. A tick
//! reads how far the peer is believed to have replicated, ships the missing
//! suffix (or a snapshot when that suffix has been compacted away), adjusts
//! its own bookkeeping from the response, and feeds the response back into
//! the server's event channel. Peers never touch consensus state directly:
//! they hold an event-sender capability instead of a server reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::event::Event;
use crate::raft_log::Log;
use crate::message::{
    AppendEntriesRequest, RequestVoteRequest, RequestVoteResponse, SnapshotRequest,
};
use crate::server::Metadata;
use crate::snapshot::Snapshot;
use crate::transport::Transporter;

/// How long `stop_heartbeat` waits for an in-flight tick before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Handle to one remote cluster member. Cheap to clone; all clones share
/// the same replication state.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    name: String,
    server_name: String,
    /// Highest log index believed to be replicated on this peer.
    prev_log_index: AtomicU64,
    heartbeat_timeout: Mutex<Duration>,
    log: Arc<Log>,
    metadata: Arc<RwLock<Metadata>>,
    transporter: Arc<dyn Transporter>,
    events: mpsc::Sender<Event>,
    last_snapshot: Arc<Mutex<Option<Snapshot>>>,
    ticker: Mutex<Option<Ticker>>,
}

struct Ticker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        server_name: String,
        heartbeat_timeout: Duration,
        log: Arc<Log>,
        metadata: Arc<RwLock<Metadata>>,
        transporter: Arc<dyn Transporter>,
        events: mpsc::Sender<Event>,
        last_snapshot: Arc<Mutex<Option<Snapshot>>>,
    ) -> Peer {
        Peer {
            inner: Arc::new(PeerInner {
                name,
                server_name,
                prev_log_index: AtomicU64::new(0),
                heartbeat_timeout: Mutex::new(heartbeat_timeout),
                log,
                metadata,
                transporter,
                events,
                last_snapshot,
                ticker: Mutex::new(None),
            }),
        }
    }

    /// The peer's unique name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Highest log index believed replicated on this peer.
    pub fn prev_log_index(&self) -> u64 {
        self.inner.prev_log_index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_prev_log_index(&self, index: u64) {
        self.inner.prev_log_index.store(index, Ordering::SeqCst);
    }

    /// Updates the heartbeat period; the running ticker picks it up on its
    /// next iteration.
    pub(crate) fn set_heartbeat_timeout(&self, timeout: Duration) {
        *self.inner.heartbeat_timeout.lock().unwrap() = timeout;
    }

    /// Spawns the heartbeat ticker. Idempotent: a running ticker is left
    /// alone.
    pub(crate) fn start_heartbeat(&self) {
        let mut ticker = self.inner.ticker.lock().unwrap();
        if ticker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(heartbeat_loop(inner, stop_rx));
        *ticker = Some(Ticker {
            stop: stop_tx,
            handle,
        });
    }

    /// Signals the ticker to exit and waits for it. A tick stuck in a
    /// transport call past the grace period is aborted instead of holding
    /// up shutdown. Idempotent.
    pub(crate) async fn stop_heartbeat(&self) {
        let ticker = self.inner.ticker.lock().unwrap().take();
        if let Some(mut ticker) = ticker {
            let _ = ticker.stop.send(true);
            if tokio::time::timeout(STOP_GRACE, &mut ticker.handle)
                .await
                .is_err()
            {
                ticker.handle.abort();
            }
        }
    }

    /// Dispatches a vote request off the role loop, forwarding any response
    /// onto `resp_tx`. Transport failures are dropped; the candidate's
    /// election timer handles silence.
    pub(crate) fn send_vote_request(
        &self,
        req: RequestVoteRequest,
        resp_tx: mpsc::Sender<RequestVoteResponse>,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            debug!(
                "[{}] requesting vote from {} for term {}",
                inner.server_name, inner.name, req.term
            );
            match inner.transporter.send_request_vote(&inner.name, req).await {
                Ok(resp) => {
                    let _ = resp_tx.send(resp).await;
                }
                Err(e) => {
                    debug!("[{}] vote request to {} failed: {}", inner.server_name, inner.name, e);
                }
            }
        });
    }
}

async fn heartbeat_loop(inner: Arc<PeerInner>, mut stop: watch::Receiver<bool>) {
    debug!("[{}] heartbeat to {} started", inner.server_name, inner.name);
    loop {
        let period = *inner.heartbeat_timeout.lock().unwrap();
        tokio::select! {
            _ = stop.changed() => break,
            _ = sleep(period) => inner.flush().await,
        }
    }
    debug!("[{}] heartbeat to {} stopped", inner.server_name, inner.name);
}

impl PeerInner {
    /// One replication round: ship the log suffix after `prev_log_index`,
    /// or a snapshot if that suffix no longer exists.
    async fn flush(&self) {
        let prev_log_index = self.prev_log_index.load(Ordering::SeqCst);
        match self.log.entries_after(prev_log_index) {
            Some((entries, prev_log_term)) => {
                self.send_append_entries(prev_log_index, prev_log_term, entries)
                    .await
            }
            None => self.send_snapshot().await,
        }
    }

    async fn send_append_entries(
        &self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<crate::entry::LogEntry>,
    ) {
        let term = self.metadata.read().unwrap().current_term;
        let sent = entries.len() as u64;
        let req = AppendEntriesRequest::new(
            term,
            self.server_name.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            self.log.commit_index(),
        );

        let resp = match self.transporter.send_append_entries(&self.name, req).await {
            Ok(resp) => resp,
            Err(e) => {
                // Absorbed here; the next tick retries.
                debug!("[{}] append entries to {} failed: {}", self.server_name, self.name, e);
                return;
            }
        };

        if resp.success {
            if sent > 0 {
                self.prev_log_index
                    .store(prev_log_index + sent, Ordering::SeqCst);
                debug!(
                    "[{}] {} caught up through index {}",
                    self.server_name,
                    self.name,
                    prev_log_index + sent
                );
            }
        } else if resp.term <= term {
            // The peer's log diverges: back up one index and retry on the
            // next tick. Below the compaction base a snapshot takes over.
            let floor = self.log.start_index();
            if prev_log_index > floor {
                self.prev_log_index
                    .store(prev_log_index - 1, Ordering::SeqCst);
            }
        }
        // A higher response term is not a divergence; the server steps down
        // when it processes the response below.

        if self
            .events
            .try_send(Event::AppendEntriesResponse(resp))
            .is_err()
        {
            debug!(
                "[{}] event queue full, dropping response from {}",
                self.server_name, self.name
            );
        }
    }

    /// The peer has fallen behind the compacted prefix: transfer the last
    /// snapshot and jump its replication cursor past it.
    async fn send_snapshot(&self) {
        let snapshot = self.last_snapshot.lock().unwrap().clone();
        let Some(snapshot) = snapshot else {
            debug!(
                "[{}] {} is behind the compacted log but no snapshot is available",
                self.server_name, self.name
            );
            return;
        };

        let req = SnapshotRequest {
            leader_name: self.server_name.clone(),
            last_index: snapshot.last_index,
            last_term: snapshot.last_term,
            peers: snapshot.peers.clone(),
            state: snapshot.state.clone(),
        };
        match self.transporter.send_snapshot(&self.name, req).await {
            Ok(resp) if resp.success => {
                info!(
                    "[{}] {} installed snapshot through index {}",
                    self.server_name, self.name, snapshot.last_index
                );
                self.prev_log_index
                    .store(snapshot.last_index, Ordering::SeqCst);
            }
            Ok(_) => {
                debug!("[{}] {} refused snapshot", self.server_name, self.name);
            }
            Err(e) => {
                debug!("[{}] snapshot to {} failed: {}", self.server_name, self.name, e);
            }
        }
    }
}
