//! The consensus actor: role state machine, event loop, RPC processing,
//! membership and snapshotting.
//!
//! ```text
//!                           timeout
//!                           ______
//!                          |      |
//!                          v      |      recv majority votes
//!   --------    timeout    -----------                         ----------
//!  |Follower| ----------> | Candidate |---------------------> |  Leader  |
//!   --------               -----------                         ----------
//!      ^          higher term/ |                          higher term |
//!      |            new leader |                                      |
//!      |_______________________|______________________________________|
//! ```
//!
//! All consensus state is mutated by one spawned task draining the event
//! channel; RPC handlers, client commands and peer responses enter as
//! [`Event`]s and are answered over one-shot reply channels. Accessors read
//! the small metadata lock and never observe partial transitions.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::event::Event;
use crate::raft_log::{ApplyFunc, Log};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse,
    SnapshotRequest, SnapshotResponse,
};
use crate::peer::Peer;
use crate::snapshot::{parse_snapshot_file_name, snapshot_file_name, Snapshot};
use crate::state_machine::{Command, CommandRegistry, StateMachine};
use crate::transport::Transporter;
use crate::{Error, Result};

/// Default heartbeat period for leader-to-peer replication.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(50);

/// Default base election timeout; the armed timer is randomized uniformly
/// in `[timeout, 2 * timeout)`.
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);

/// Default period of the background snapshot task.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// How long a client command may wait for its commit before giving up.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound of the event channel. Heartbeat responses are dropped rather than
/// queued when it is full; the peer retries on its next tick.
const EVENT_QUEUE_SIZE: usize = 256;

/// The role a server currently plays in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Follower,
    Candidate,
    Leader,
}

/// Consensus metadata guarded by one small read/write lock. The role loops
/// are the only writers; accessors take short read locks.
pub(crate) struct Metadata {
    pub(crate) state: ServerState,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<String>,
    pub(crate) leader: Option<String>,
}

/// A member of a Raft cluster. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

pub(crate) struct ServerShared {
    name: String,
    path: PathBuf,
    context: Arc<dyn Any + Send + Sync>,
    transporter: Arc<dyn Transporter>,
    state_machine: Mutex<Option<Box<dyn StateMachine>>>,
    metadata: Arc<RwLock<Metadata>>,
    log: Arc<Log>,
    peers: RwLock<HashMap<String, Peer>>,
    events: mpsc::Sender<Event>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    election_timeout: RwLock<Duration>,
    heartbeat_timeout: RwLock<Duration>,
    current_snapshot: Mutex<Option<Snapshot>>,
    last_snapshot: Arc<Mutex<Option<Snapshot>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    snapshot_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Creates a new server with a log under `path`. The registry decodes
    /// persisted commands back into executable form; `context` is the opaque
    /// application handle passed to every [`Command::apply`].
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        transporter: Arc<dyn Transporter>,
        state_machine: Option<Box<dyn StateMachine>>,
        registry: Arc<dyn CommandRegistry>,
        context: Arc<dyn Any + Send + Sync>,
    ) -> Result<Server> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Config("server name cannot be blank".to_string()));
        }

        let apply_context = context.clone();
        let apply: ApplyFunc = Box::new(move |entry| {
            let command = registry.deserialize(entry.command_name(), entry.command())?;
            command.apply(apply_context.as_ref())
        });

        let (events, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        Ok(Server {
            shared: Arc::new(ServerShared {
                name,
                path: path.into(),
                context,
                transporter,
                state_machine: Mutex::new(state_machine),
                metadata: Arc::new(RwLock::new(Metadata {
                    state: ServerState::Stopped,
                    current_term: 0,
                    voted_for: None,
                    leader: None,
                })),
                log: Arc::new(Log::new(apply)),
                peers: RwLock::new(HashMap::new()),
                events,
                event_rx: Mutex::new(Some(event_rx)),
                election_timeout: RwLock::new(DEFAULT_ELECTION_TIMEOUT),
                heartbeat_timeout: RwLock::new(DEFAULT_HEARTBEAT_TIMEOUT),
                current_snapshot: Mutex::new(None),
                last_snapshot: Arc::new(Mutex::new(None)),
                loop_handle: Mutex::new(None),
                snapshot_handle: Mutex::new(None),
            }),
        })
    }

    //--------------------------------------
    // Accessors
    //--------------------------------------

    /// The server's unique name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The storage directory.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Path of the append-only log file.
    pub fn log_path(&self) -> PathBuf {
        self.shared.path.join("log")
    }

    /// The opaque application context commands apply against.
    pub fn context(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.shared.context
    }

    /// Name of the server currently believed to be leader, if any.
    pub fn leader(&self) -> Option<String> {
        self.shared.metadata.read().unwrap().leader.clone()
    }

    /// The current term.
    pub fn term(&self) -> u64 {
        self.shared.term()
    }

    /// The current role.
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// Who this server voted for in the current term, if anyone.
    pub fn voted_for(&self) -> Option<String> {
        self.shared.metadata.read().unwrap().voted_for.clone()
    }

    /// Highest log index known to be committed.
    pub fn commit_index(&self) -> u64 {
        self.shared.log.commit_index()
    }

    /// True while a role loop is active.
    pub fn running(&self) -> bool {
        self.shared.state() != ServerState::Stopped
    }

    /// True when the log holds no entries and was never compacted.
    pub fn is_log_empty(&self) -> bool {
        self.shared.log.is_empty()
    }

    /// Command name of the last log entry.
    pub fn last_command_name(&self) -> Option<String> {
        self.shared.log.last_command_name()
    }

    /// A copy of every in-memory log entry. This should only be used for
    /// debugging purposes.
    pub fn log_entries(&self) -> Vec<Arc<crate::entry::LogEntry>> {
        self.shared.log.entries()
    }

    /// Number of members in the consensus, including this server.
    pub fn member_count(&self) -> usize {
        self.shared.peers.read().unwrap().len() + 1
    }

    /// Number of members required for a majority.
    pub fn quorum_size(&self) -> usize {
        self.shared.quorum_size()
    }

    /// Read-only view of the peer set: name to replicated index.
    pub fn peers(&self) -> HashMap<String, u64> {
        self.shared
            .peers
            .read()
            .unwrap()
            .iter()
            .map(|(name, peer)| (name.clone(), peer.prev_log_index()))
            .collect()
    }

    /// The base election timeout.
    pub fn election_timeout(&self) -> Duration {
        *self.shared.election_timeout.read().unwrap()
    }

    pub fn set_election_timeout(&self, timeout: Duration) {
        *self.shared.election_timeout.write().unwrap() = timeout;
    }

    /// The heartbeat period used by peer replication.
    pub fn heartbeat_timeout(&self) -> Duration {
        *self.shared.heartbeat_timeout.read().unwrap()
    }

    /// Updates the heartbeat period, propagating it to every peer ticker.
    pub fn set_heartbeat_timeout(&self, timeout: Duration) {
        *self.shared.heartbeat_timeout.write().unwrap() = timeout;
        for peer in self.shared.peers.read().unwrap().values() {
            peer.set_heartbeat_timeout(timeout);
        }
    }

    //--------------------------------------
    // Lifecycle
    //--------------------------------------

    /// Opens the log, replays it, and adopts its last term. Must be called
    /// once before starting a role loop.
    pub fn initialize(&self) -> Result<()> {
        if self.shared.state() != ServerState::Stopped {
            return Err(Error::AlreadyRunning);
        }
        fs::create_dir_all(self.shared.path.join("snapshot"))?;
        self.shared.log.open(&self.log_path())?;
        self.shared.metadata.write().unwrap().current_term = self.shared.log.current_term();
        Ok(())
    }

    /// Starts the event loop in the Follower role.
    pub fn start_follower(&self) -> Result<()> {
        self.shared.set_state(ServerState::Follower);
        self.start_loop()
    }

    /// Starts directly as Leader, incrementing the term without an election.
    /// Only safe for single-node bootstrap: refused when peers are
    /// configured.
    pub fn start_leader(&self) -> Result<()> {
        if !self.shared.peers.read().unwrap().is_empty() {
            return Err(Error::Config(
                "start_leader is restricted to single-node bootstrap".to_string(),
            ));
        }
        self.shared.set_state(ServerState::Leader);
        self.shared.metadata.write().unwrap().current_term += 1;
        self.start_loop()
    }

    fn start_loop(&self) -> Result<()> {
        let rx = self
            .shared
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyRunning)?;
        let shared = self.shared.clone();
        *self.shared.loop_handle.lock().unwrap() = Some(tokio::spawn(run_loop(shared, rx)));
        Ok(())
    }

    /// Delivers the stop sentinel, waits for the role loop to exit, stops
    /// all replication, and closes the log.
    pub async fn stop(&self) {
        if let Some(handle) = self.shared.snapshot_handle.lock().unwrap().take() {
            handle.abort();
        }

        let handle = self.shared.loop_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if self.shared.events.send(Event::Stop).await.is_ok() {
                let _ = handle.await;
            } else {
                handle.abort();
            }
        } else {
            self.shared.set_state(ServerState::Stopped);
        }

        // The leader loop already stopped these on exit; stopping twice is
        // harmless and covers non-leader shutdown.
        let peers: Vec<Peer> = self.shared.peers.read().unwrap().values().cloned().collect();
        for peer in peers {
            peer.stop_heartbeat().await;
        }
        self.shared.log.close();
    }

    //--------------------------------------
    // Client commands and RPC entry points
    //--------------------------------------

    /// Replicates and applies a command, returning the state machine's
    /// result once the entry commits. Non-leaders answer
    /// [`Error::NotLeader`]; a commit that misses its deadline answers
    /// [`Error::CommandTimeout`] even though the entry may still commit.
    pub async fn execute(&self, command: Box<dyn Command>) -> Result<Vec<u8>> {
        if !self.running() {
            return Err(Error::NotRunning);
        }
        let (reply, rx) = oneshot::channel();
        self.shared
            .events
            .send(Event::Command { command, reply })
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)?
    }

    /// Feeds an inbound AppendEntries RPC through the event loop.
    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        if !self.running() {
            return Err(Error::NotRunning);
        }
        let (reply, rx) = oneshot::channel();
        self.shared
            .events
            .send(Event::AppendEntries { req, reply })
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    /// Feeds an inbound RequestVote RPC through the event loop.
    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        if !self.running() {
            return Err(Error::NotRunning);
        }
        let (reply, rx) = oneshot::channel();
        self.shared
            .events
            .send(Event::RequestVote { req, reply })
            .await
            .map_err(|_| Error::NotRunning)?;
        rx.await.map_err(|_| Error::NotRunning)
    }

    //--------------------------------------
    // Membership
    //--------------------------------------

    /// Registers a peer. Adding this server's own name is a no-op; adding
    /// an existing peer is an error and mutates nothing. If this server is
    /// currently leading, replication to the new peer starts immediately.
    pub fn add_peer(&self, name: &str) -> Result<()> {
        let mut peers = self.shared.peers.write().unwrap();
        if peers.contains_key(name) {
            return Err(Error::DuplicatePeer(name.to_string()));
        }
        if name == self.shared.name {
            return Ok(());
        }

        let peer = Peer::new(
            name.to_string(),
            self.shared.name.clone(),
            *self.shared.heartbeat_timeout.read().unwrap(),
            self.shared.log.clone(),
            self.shared.metadata.clone(),
            self.shared.transporter.clone(),
            self.shared.events.clone(),
            self.shared.last_snapshot.clone(),
        );
        if self.shared.state() == ServerState::Leader {
            peer.start_heartbeat();
        }
        peers.insert(name.to_string(), peer);
        Ok(())
    }

    /// Unregisters a peer and stops its replication. Removing this server's
    /// own name is a no-op.
    pub async fn remove_peer(&self, name: &str) -> Result<()> {
        if name == self.shared.name {
            return Ok(());
        }
        let peer = self
            .shared
            .peers
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| Error::PeerNotFound(name.to_string()))?;
        peer.stop_heartbeat().await;
        Ok(())
    }

    //--------------------------------------
    // Log compaction
    //--------------------------------------

    /// Where the snapshot covering `(last_term, last_index)` lives.
    pub fn snapshot_path(&self, last_term: u64, last_index: u64) -> PathBuf {
        self.shared.snapshot_path(last_term, last_index)
    }

    /// Captures the state machine through the commit point, persists the
    /// snapshot, and compacts the log prefix it covers.
    pub fn take_snapshot(&self) -> Result<()> {
        let shared = &self.shared;
        let (last_index, last_term);
        {
            let mut current = shared.current_snapshot.lock().unwrap();
            if current.is_some() {
                return Err(Error::SnapshotInProgress);
            }

            let (index, term) = shared.log.commit_info();
            if index == 0 || term == 0 {
                return Err(Error::NoCommittedEntries);
            }
            last_index = index;
            last_term = term;

            let state = match shared.state_machine.lock().unwrap().as_ref() {
                Some(machine) => machine.save()?,
                None => vec![0],
            };

            let mut peer_names: Vec<String> =
                shared.peers.read().unwrap().keys().cloned().collect();
            peer_names.push(shared.name.clone());

            *current = Some(Snapshot::new(
                last_index,
                last_term,
                peer_names,
                state,
                shared.snapshot_path(last_term, last_index),
            ));
        }

        shared.save_snapshot()?;
        shared.log.compact(last_index, last_term)?;
        info!(
            "[{}] snapshot taken through index {} term {}",
            shared.name, last_index, last_term
        );
        Ok(())
    }

    /// Installs a snapshot pushed by the leader to a follower that has
    /// fallen behind the compacted log: restores the state machine, rebuilds
    /// the peer set, adopts the snapshot's term and commit point, persists
    /// the snapshot and compacts the log.
    pub fn snapshot_recovery(&self, req: &SnapshotRequest) -> Result<SnapshotResponse> {
        let shared = &self.shared;

        if let Some(machine) = shared.state_machine.lock().unwrap().as_mut() {
            machine.recovery(&req.state)?;
        }
        for peer in &req.peers {
            match self.add_peer(peer) {
                Ok(()) | Err(Error::DuplicatePeer(_)) => {}
                Err(e) => return Err(e),
            }
        }

        shared.metadata.write().unwrap().current_term = req.last_term;
        shared.log.update_commit_index(req.last_index);

        *shared.current_snapshot.lock().unwrap() = Some(Snapshot::new(
            req.last_index,
            req.last_term,
            req.peers.clone(),
            req.state.clone(),
            shared.snapshot_path(req.last_term, req.last_index),
        ));
        shared.save_snapshot()?;
        shared.log.compact(req.last_index, req.last_term)?;

        info!(
            "[{}] installed snapshot through index {} from {}",
            shared.name, req.last_index, req.leader_name
        );
        Ok(SnapshotResponse::new(req.last_term, true, req.last_index))
    }

    /// Restores the newest snapshot under `<path>/snapshot/` at startup:
    /// verifies its checksum, rehydrates the state machine and peer set, and
    /// advances the log's compaction base and commit pointer.
    pub fn load_snapshot(&self) -> Result<()> {
        let shared = &self.shared;
        let dir = shared.path.join("snapshot");

        let mut newest: Option<(u64, u64)> = None;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(pair) = parse_snapshot_file_name(&entry.file_name().to_string_lossy()) {
                if newest.map_or(true, |best| pair > best) {
                    newest = Some(pair);
                }
            }
        }
        let (last_term, last_index) =
            newest.ok_or_else(|| Error::BadSnapshot("no snapshot found".to_string()))?;

        let snapshot = Snapshot::load(&dir.join(snapshot_file_name(last_term, last_index)))?;

        if let Some(machine) = shared.state_machine.lock().unwrap().as_mut() {
            machine.recovery(&snapshot.state)?;
        }
        for peer in &snapshot.peers {
            match self.add_peer(peer) {
                Ok(()) | Err(Error::DuplicatePeer(_)) => {}
                Err(e) => return Err(e),
            }
        }

        shared.log.compact(snapshot.last_index, snapshot.last_term)?;
        shared.log.update_commit_index(snapshot.last_index);
        {
            let mut metadata = shared.metadata.write().unwrap();
            if metadata.current_term < snapshot.last_term {
                metadata.current_term = snapshot.last_term;
            }
        }

        info!(
            "[{}] loaded snapshot through index {} term {}",
            shared.name, snapshot.last_index, snapshot.last_term
        );
        *shared.last_snapshot.lock().unwrap() = Some(snapshot);
        Ok(())
    }

    /// Spawns the background compaction task: every `interval` it attempts
    /// a snapshot, skipping quietly when there is nothing new to capture.
    /// The interval is injectable so tests control the cadence.
    pub fn start_snapshot_loop(&self, interval: Duration) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if server.state() == ServerState::Stopped {
                    break;
                }
                if let Err(e) = server.take_snapshot() {
                    debug!("[{}] background snapshot skipped: {}", server.name(), e);
                }
            }
        });
        if let Some(old) = self
            .shared
            .snapshot_handle
            .lock()
            .unwrap()
            .replace(handle)
        {
            old.abort();
        }
    }
}

impl ServerShared {
    fn state(&self) -> ServerState {
        self.metadata.read().unwrap().state
    }

    fn term(&self) -> u64 {
        self.metadata.read().unwrap().current_term
    }

    fn set_state(&self, state: ServerState) {
        let mut metadata = self.metadata.write().unwrap();
        metadata.state = state;
        if state == ServerState::Leader {
            metadata.leader = Some(self.name.clone());
        }
    }

    fn quorum_size(&self) -> usize {
        (self.peers.read().unwrap().len() + 1) / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let base = *self.election_timeout.read().unwrap();
        rand::thread_rng().gen_range(base..base * 2)
    }

    fn snapshot_path(&self, last_term: u64, last_index: u64) -> PathBuf {
        self.path
            .join("snapshot")
            .join(snapshot_file_name(last_term, last_index))
    }

    /// Uniform term-adoption rule shared by every role loop. A higher term
    /// always demotes to Follower and clears the vote; an equal-term
    /// AppendEntries tells a candidate who won the election it lost.
    fn adopt_term(&self, term: u64, leader: Option<&str>, from_append: bool) {
        let mut metadata = self.metadata.write().unwrap();
        if term > metadata.current_term {
            if metadata.state == ServerState::Leader || metadata.state == ServerState::Candidate {
                info!(
                    "📉 [{}] stepping down: term {} observed above {}",
                    self.name, term, metadata.current_term
                );
            }
            metadata.state = ServerState::Follower;
            metadata.current_term = term;
            metadata.leader = leader.map(str::to_string);
            metadata.voted_for = None;
        } else if term == metadata.current_term
            && metadata.state == ServerState::Candidate
            && from_append
        {
            metadata.state = ServerState::Follower;
            metadata.leader = leader.map(str::to_string);
        }
    }

    /// Receiver side of AppendEntries. Returns the response plus whether
    /// the caller should re-arm its election timer (i.e. the request came
    /// from a legitimate current-term leader).
    fn process_append_entries_request(
        &self,
        req: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        if req.term < self.term() {
            debug!(
                "[{}] rejecting append entries from {}: stale term {}",
                self.name, req.leader_name, req.term
            );
            return (
                AppendEntriesResponse::failure(self.term(), self.log.commit_index()),
                false,
            );
        }

        self.adopt_term(req.term, Some(&req.leader_name), true);

        if let Err(e) = self.log.truncate(req.prev_log_index, req.prev_log_term) {
            debug!("[{}] append entries truncate failed: {}", self.name, e);
            return (
                AppendEntriesResponse::failure(self.term(), self.log.commit_index()),
                true,
            );
        }
        if let Err(e) = self.log.append_entries(req.entries) {
            debug!("[{}] append entries append failed: {}", self.name, e);
            return (
                AppendEntriesResponse::failure(self.term(), self.log.commit_index()),
                true,
            );
        }
        if let Err(e) = self.log.set_commit_index(req.commit_index) {
            debug!("[{}] append entries commit failed: {}", self.name, e);
            return (
                AppendEntriesResponse::failure(self.term(), self.log.commit_index()),
                true,
            );
        }

        (
            AppendEntriesResponse::success(self.term(), self.log.commit_index()),
            true,
        )
    }

    /// Receiver side of RequestVote. Grants at most one vote per term, and
    /// only to candidates whose log is at least as up to date as ours.
    fn process_request_vote_request(
        &self,
        req: &RequestVoteRequest,
    ) -> (RequestVoteResponse, bool) {
        if req.term < self.term() {
            debug!(
                "[{}] rejecting vote for {}: stale term {}",
                self.name, req.candidate_name, req.term
            );
            return (RequestVoteResponse::deny(self.term()), false);
        }

        self.adopt_term(req.term, None, false);

        {
            let metadata = self.metadata.read().unwrap();
            if let Some(voted_for) = &metadata.voted_for {
                if *voted_for != req.candidate_name {
                    debug!(
                        "[{}] rejecting vote for {}: already voted for {}",
                        self.name, req.candidate_name, voted_for
                    );
                    return (RequestVoteResponse::deny(metadata.current_term), false);
                }
            }
        }

        let (last_index, last_term) = self.log.last_info();
        if last_term > req.last_log_term
            || (last_term == req.last_log_term && last_index > req.last_log_index)
        {
            debug!(
                "[{}] rejecting vote for {}: log not up to date ({}/{} vs {}/{})",
                self.name,
                req.candidate_name,
                req.last_log_index,
                req.last_log_term,
                last_index,
                last_term
            );
            return (RequestVoteResponse::deny(self.term()), false);
        }

        let term = {
            let mut metadata = self.metadata.write().unwrap();
            metadata.voted_for = Some(req.candidate_name.clone());
            metadata.current_term
        };
        debug!(
            "[{}] voted for {} at term {}",
            self.name, req.candidate_name, term
        );
        (RequestVoteResponse::grant(term), true)
    }

    /// Leader side of a client command: append locally, register a commit
    /// waiter with a deadline, and acknowledge our own append so commit
    /// accounting counts the leader toward the quorum.
    fn process_command(&self, command: Box<dyn Command>, reply: oneshot::Sender<Result<Vec<u8>>>) {
        debug!("[{}] processing command {}", self.name, command.command_name());

        let payload = match command.serialize() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let term = self.term();
        let entry = self
            .log
            .create_entry(term, command.command_name().to_string(), payload);
        let commit_rx = entry.attach_commit_signal();

        if let Err(e) = self.log.append_entry(entry.clone()) {
            debug!("[{}] command append failed: {}", self.name, e);
            let _ = reply.send(Err(e));
            return;
        }

        // Release the client once the entry commits; never leave it hanging
        // past the deadline. A dropped signal (our entry was truncated by a
        // newer leader) counts as a timeout too.
        let log = self.log.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(COMMAND_TIMEOUT, commit_rx).await {
                Ok(Ok(())) => {
                    let _ = reply.send(log.entry_result(&entry));
                }
                _ => {
                    let _ = reply.send(Err(Error::CommandTimeout));
                }
            }
        });

        let ack = AppendEntriesResponse::success(term, self.log.commit_index());
        if self.events.try_send(Event::AppendEntriesResponse(ack)).is_err() {
            debug!(
                "[{}] event queue full, dropping self-acknowledgement",
                self.name
            );
        }
    }

    /// Leader side of replication accounting: once a quorum of successful
    /// responses accumulates, commit the highest index a true majority has
    /// replicated (the quorum-th largest of `{our last index} ∪ {peer
    /// replication cursors}`).
    fn process_append_entries_response(
        &self,
        resp: &AppendEntriesResponse,
        commit_count: &mut usize,
    ) {
        if resp.term > self.term() {
            self.adopt_term(resp.term, None, false);
            return;
        }
        if !resp.success {
            // The peer's ticker already backed its cursor up; nothing to do.
            return;
        }

        *commit_count += 1;
        if *commit_count < self.quorum_size() {
            return;
        }

        let mut indices = vec![self.log.current_index()];
        indices.extend(
            self.peers
                .read()
                .unwrap()
                .values()
                .map(|peer| peer.prev_log_index()),
        );
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = indices[self.quorum_size() - 1];

        if majority_index > self.log.commit_index() {
            debug!("[{}] advancing commit index to {}", self.name, majority_index);
            // Applies each newly committed entry and releases its waiter.
            if let Err(e) = self.log.set_commit_index(majority_index) {
                warn!("[{}] failed to advance commit index: {}", self.name, e);
            }
        }
    }

    /// Persists the pending snapshot and rotates it into `last_snapshot`,
    /// deleting the previous one when it covers a different point.
    fn save_snapshot(&self) -> Result<()> {
        let snapshot = self
            .current_snapshot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::BadSnapshot("no snapshot to save".to_string()))?;
        snapshot.save()?;

        let mut last = self.last_snapshot.lock().unwrap();
        if let Some(old) = &*last {
            if old.last_index != snapshot.last_index || old.last_term != snapshot.last_term {
                if let Err(e) = old.remove() {
                    debug!("[{}] failed to remove old snapshot: {}", self.name, e);
                }
            }
        }
        *last = Some(snapshot);
        Ok(())
    }
}

//--------------------------------------
// Role loops
//--------------------------------------

/// The outer loop: dispatch to the active role until Stopped, then hand the
/// event receiver back so the server can be started again.
async fn run_loop(shared: Arc<ServerShared>, mut rx: mpsc::Receiver<Event>) {
    loop {
        let state = shared.state();
        debug!("[{}] server loop: {:?}", shared.name, state);
        match state {
            ServerState::Follower => follower_loop(&shared, &mut rx).await,
            ServerState::Candidate => candidate_loop(&shared, &mut rx).await,
            ServerState::Leader => leader_loop(&shared, &mut rx).await,
            ServerState::Stopped => break,
        }
    }
    debug!("[{}] server loop ended", shared.name);
    // Drop anything still queued; dropped reply channels release their
    // callers with a not-running error instead of leaving them waiting.
    while rx.try_recv().is_ok() {}
    *shared.event_rx.lock().unwrap() = Some(rx);
}

/// Responds to RPCs from candidates and leaders; becomes a candidate when
/// the election timer fires without a valid AppendEntries or a granted vote.
async fn follower_loop(shared: &Arc<ServerShared>, rx: &mut mpsc::Receiver<Event>) {
    let mut deadline = Instant::now() + shared.random_election_timeout();

    while shared.state() == ServerState::Follower {
        let mut update = false;
        tokio::select! {
            event = rx.recv() => {
                match event {
                    None | Some(Event::Stop) => shared.set_state(ServerState::Stopped),
                    Some(Event::Command { reply, .. }) => {
                        let _ = reply.send(Err(Error::NotLeader));
                    }
                    Some(Event::AppendEntries { req, reply }) => {
                        let (resp, changed) = shared.process_append_entries_request(req);
                        update = changed;
                        let _ = reply.send(resp);
                    }
                    Some(Event::RequestVote { req, reply }) => {
                        let (resp, changed) = shared.process_request_vote_request(&req);
                        update = changed;
                        let _ = reply.send(resp);
                    }
                    // Replication responses only matter to leaders.
                    Some(Event::AppendEntriesResponse(_)) => {}
                }
            }
            _ = sleep_until(deadline) => {
                shared.set_state(ServerState::Candidate);
            }
        }
        if update {
            deadline = Instant::now() + shared.random_election_timeout();
        }
    }
}

/// Runs election rounds: bump the term, vote for ourselves, solicit the
/// peers, and either win a quorum, discover a legitimate leader, or time
/// out and start over.
async fn candidate_loop(shared: &Arc<ServerShared>, rx: &mut mpsc::Receiver<Event>) {
    let (last_log_index, last_log_term) = shared.log.last_info();
    shared.metadata.write().unwrap().leader = None;

    while shared.state() == ServerState::Candidate {
        let term = {
            let mut metadata = shared.metadata.write().unwrap();
            metadata.current_term += 1;
            metadata.voted_for = Some(shared.name.clone());
            metadata.current_term
        };
        info!("🗳️  [{}] starting election for term {}", shared.name, term);

        let peers: Vec<Peer> = shared.peers.read().unwrap().values().cloned().collect();
        let (resp_tx, mut resp_rx) = mpsc::channel(peers.len().max(1));
        for peer in &peers {
            peer.send_vote_request(
                RequestVoteRequest::new(term, shared.name.clone(), last_log_index, last_log_term),
                resp_tx.clone(),
            );
        }
        drop(resp_tx);

        let mut votes_granted = 1usize; // our own vote
        let mut votes_open = true;
        let deadline = Instant::now() + shared.random_election_timeout();
        let mut timed_out = false;

        while shared.state() == ServerState::Candidate && !timed_out {
            if votes_granted >= shared.quorum_size() {
                info!(
                    "👑 [{}] won election with {} votes for term {}",
                    shared.name, votes_granted, term
                );
                shared.set_state(ServerState::Leader);
                break;
            }

            tokio::select! {
                resp = resp_rx.recv(), if votes_open => {
                    match resp {
                        Some(resp) if resp.vote_granted => {
                            votes_granted += 1;
                            debug!(
                                "[{}] vote granted ({} of {} needed)",
                                shared.name, votes_granted, shared.quorum_size()
                            );
                        }
                        Some(resp) if resp.term > shared.term() => {
                            shared.adopt_term(resp.term, None, false);
                        }
                        Some(_) => {}
                        None => votes_open = false,
                    }
                }
                event = rx.recv() => {
                    match event {
                        None | Some(Event::Stop) => shared.set_state(ServerState::Stopped),
                        Some(Event::Command { reply, .. }) => {
                            let _ = reply.send(Err(Error::NotLeader));
                        }
                        Some(Event::AppendEntries { req, reply }) => {
                            let (resp, _) = shared.process_append_entries_request(req);
                            let _ = reply.send(resp);
                        }
                        Some(Event::RequestVote { req, reply }) => {
                            let (resp, _) = shared.process_request_vote_request(&req);
                            let _ = reply.send(resp);
                        }
                        Some(Event::AppendEntriesResponse(_)) => {}
                    }
                }
                _ = sleep_until(deadline) => {
                    // No resolution this round; the outer loop increments
                    // the term and starts a fresh one.
                    timed_out = true;
                }
            }
        }
    }
}

/// Replicates to every peer and advances the commit point as responses
/// accumulate. Leaving leadership for any reason stops all heartbeats.
async fn leader_loop(shared: &Arc<ServerShared>, rx: &mut mpsc::Receiver<Event>) {
    let mut commit_count = 0usize;
    let log_index = shared.log.current_index();

    {
        let peers = shared.peers.read().unwrap();
        for peer in peers.values() {
            peer.set_prev_log_index(log_index);
            peer.start_heartbeat();
        }
    }
    info!(
        "👑 [{}] leading term {} from index {}",
        shared.name,
        shared.term(),
        log_index
    );

    while shared.state() == ServerState::Leader {
        match rx.recv().await {
            None | Some(Event::Stop) => shared.set_state(ServerState::Stopped),
            Some(Event::Command { command, reply }) => shared.process_command(command, reply),
            Some(Event::AppendEntries { req, reply }) => {
                let (resp, _) = shared.process_append_entries_request(req);
                let _ = reply.send(resp);
            }
            Some(Event::AppendEntriesResponse(resp)) => {
                shared.process_append_entries_response(&resp, &mut commit_count);
            }
            Some(Event::RequestVote { req, reply }) => {
                let (resp, _) = shared.process_request_vote_request(&req);
                let _ = reply.send(resp);
            }
        }
    }

    let peers: Vec<Peer> = shared.peers.read().unwrap().values().cloned().collect();
    for peer in peers {
        peer.stop_heartbeat().await;
    }
}
