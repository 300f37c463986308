//! Snapshot, compaction and restart scenarios on a single server.

use std::any::Any;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::sleep;

use raft_server::{
    AppendEntriesRequest, AppendEntriesResponse, Command, CommandRegistry, Error,
    RequestVoteRequest, RequestVoteResponse, Result, Server, SnapshotRequest, SnapshotResponse,
    StateMachine, Transporter,
};

type Applied = Mutex<Vec<String>>;

#[derive(Debug)]
struct AppendValue {
    value: String,
}

impl Command for AppendValue {
    fn command_name(&self) -> &str {
        "append"
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(self.value.as_bytes().to_vec())
    }

    fn apply(&self, context: &(dyn Any + Send + Sync)) -> Result<Vec<u8>> {
        let applied = context
            .downcast_ref::<Applied>()
            .ok_or_else(|| Error::Command("unexpected context type".to_string()))?;
        applied.lock().unwrap().push(self.value.clone());
        Ok(self.value.as_bytes().to_vec())
    }
}

struct Registry;

impl CommandRegistry for Registry {
    fn deserialize(&self, name: &str, payload: &[u8]) -> Result<Box<dyn Command>> {
        match name {
            "append" => Ok(Box::new(AppendValue {
                value: String::from_utf8_lossy(payload).into_owned(),
            })),
            other => Err(Error::Command(format!("unknown command: {}", other))),
        }
    }
}

struct VecStateMachine {
    applied: Arc<Applied>,
}

impl StateMachine for VecStateMachine {
    fn save(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&*self.applied.lock().unwrap())?)
    }

    fn recovery(&mut self, state: &[u8]) -> Result<()> {
        *self.applied.lock().unwrap() = serde_json::from_slice(state)?;
        Ok(())
    }
}

/// These scenarios are single-node; the transport never delivers anything.
struct UnreachableTransporter;

#[async_trait]
impl Transporter for UnreachableTransporter {
    async fn send_append_entries(
        &self,
        peer: &str,
        _req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        Err(Error::Transport(format!("{} unreachable", peer)))
    }

    async fn send_request_vote(
        &self,
        peer: &str,
        _req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        Err(Error::Transport(format!("{} unreachable", peer)))
    }

    async fn send_snapshot(&self, peer: &str, _req: SnapshotRequest) -> Result<SnapshotResponse> {
        Err(Error::Transport(format!("{} unreachable", peer)))
    }
}

fn build_server(name: &str, dir: &TempDir) -> (Server, Arc<Applied>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let applied: Arc<Applied> = Arc::new(Mutex::new(Vec::new()));
    let server = Server::new(
        name,
        dir.path(),
        Arc::new(UnreachableTransporter),
        Some(Box::new(VecStateMachine {
            applied: applied.clone(),
        })),
        Arc::new(Registry),
        applied.clone() as Arc<dyn Any + Send + Sync>,
    )
    .expect("failed to create server");
    server.initialize().expect("failed to initialize server");
    (server, applied)
}

async fn submit(server: &Server, value: String) {
    server
        .execute(Box::new(AppendValue { value }))
        .await
        .expect("command failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_with_snapshot() {
    let dir = TempDir::new().unwrap();
    let term;

    {
        let (server, applied) = build_server("n1", &dir);
        server.start_leader().expect("failed to start leader");

        for i in 1..=1000 {
            submit(&server, format!("v{}", i)).await;
        }
        assert_eq!(server.commit_index(), 1000);
        assert_eq!(applied.lock().unwrap().len(), 1000);
        term = server.term();

        server.take_snapshot().expect("snapshot failed");
        assert!(server.log_entries().is_empty());
        assert_eq!(server.commit_index(), 1000);

        server.stop().await;
    }

    // A fresh process: empty state machine until the snapshot restores it.
    let (server, applied) = build_server("n1", &dir);
    assert!(applied.lock().unwrap().is_empty());

    server.load_snapshot().expect("failed to load snapshot");
    assert_eq!(server.commit_index(), 1000);
    assert_eq!(server.term(), term);
    assert!(server.log_entries().is_empty());
    assert!(!server.is_log_empty());

    let restored = applied.lock().unwrap().clone();
    assert_eq!(restored.len(), 1000);
    assert_eq!(restored[0], "v1");
    assert_eq!(restored[999], "v1000");

    // The log continues exactly where the snapshot left off.
    server.start_leader().expect("failed to restart leader");
    submit(&server, "v1001".to_string()).await;
    assert_eq!(server.commit_index(), 1001);
    assert_eq!(applied.lock().unwrap().len(), 1001);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_requires_committed_entries() {
    let dir = TempDir::new().unwrap();
    let (server, _applied) = build_server("n1", &dir);
    server.start_leader().expect("failed to start leader");

    match server.take_snapshot() {
        Err(Error::NoCommittedEntries) => {}
        other => panic!("expected no-committed-entries error, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_snapshot_replaces_old_one() {
    let dir = TempDir::new().unwrap();
    let (server, _applied) = build_server("n1", &dir);
    server.start_leader().expect("failed to start leader");

    submit(&server, "a".to_string()).await;
    server.take_snapshot().expect("first snapshot failed");

    submit(&server, "b".to_string()).await;
    submit(&server, "c".to_string()).await;
    server.take_snapshot().expect("second snapshot failed");

    let names: Vec<String> = fs::read_dir(dir.path().join("snapshot"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["1_3.ss".to_string()]);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_snapshot_recovery_installs_leader_state() {
    let dir = TempDir::new().unwrap();
    let (server, applied) = build_server("n1", &dir);

    let image = serde_json::to_vec(&vec!["x".to_string(), "y".to_string()]).unwrap();
    let req = SnapshotRequest {
        leader_name: "n9".to_string(),
        last_index: 50,
        last_term: 2,
        peers: vec!["n1".to_string(), "n9".to_string()],
        state: image,
    };

    let resp = server.snapshot_recovery(&req).expect("recovery failed");
    assert!(resp.success);
    assert_eq!(resp.commit_index, 50);

    assert_eq!(server.commit_index(), 50);
    assert_eq!(server.term(), 2);
    assert_eq!(*applied.lock().unwrap(), vec!["x", "y"]);
    // The snapshot's membership is rehydrated; our own name is skipped.
    assert_eq!(server.member_count(), 2);
    assert!(server.peers().contains_key("n9"));
    // The installed snapshot is also persisted locally.
    assert!(dir.path().join("snapshot").join("2_50.ss").exists());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_snapshot_loop() {
    let dir = TempDir::new().unwrap();
    let (server, _applied) = build_server("n1", &dir);
    server.start_leader().expect("failed to start leader");

    submit(&server, "a".to_string()).await;
    submit(&server, "b".to_string()).await;

    // The interval is injectable precisely so tests can run it fast.
    server.start_snapshot_loop(Duration::from_millis(50));

    let mut compacted = false;
    for _ in 0..50 {
        sleep(Duration::from_millis(20)).await;
        if dir.path().join("snapshot").read_dir().unwrap().next().is_some() {
            compacted = true;
            break;
        }
    }
    assert!(compacted, "background task never produced a snapshot");
    assert!(dir.path().join("snapshot").join("1_2.ss").exists());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupt_snapshot_is_refused_at_startup() {
    let dir = TempDir::new().unwrap();

    {
        let (server, _applied) = build_server("n1", &dir);
        server.start_leader().expect("failed to start leader");
        submit(&server, "a".to_string()).await;
        server.take_snapshot().expect("snapshot failed");
        server.stop().await;
    }

    // Flip one payload byte; the restart must refuse the snapshot instead
    // of restoring garbage.
    let path = dir.path().join("snapshot").join("1_1.ss");
    let mut data = fs::read(&path).unwrap();
    let last = data.len() - 1;
    data[last] ^= 0x01;
    fs::write(&path, data).unwrap();

    let (server, applied) = build_server("n1", &dir);
    match server.load_snapshot() {
        Err(Error::ChecksumMismatch { .. }) => {}
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
    assert!(applied.lock().unwrap().is_empty());
    assert_eq!(server.commit_index(), 0);
}
