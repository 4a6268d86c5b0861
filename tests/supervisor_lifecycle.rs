//! Worker lifecycle against real child processes of the livescribe binary.

use livescribe::audio::AudioChunk;
use livescribe::config::Config;
use livescribe::models::Catalog;
use livescribe::worker::{
    AudioFrame, ModelSupervisor, StopOutcome, SupervisorSettings, WorkerInput, WorkerLauncher,
    WorkerSettings, WorkerState,
};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn supervisor(models_dir: &TempDir, stop_timeout: Duration) -> ModelSupervisor {
    let mut config = Config::default();
    config.models.dir = Some(models_dir.path().to_path_buf());
    config.worker.poll_interval_ms = 50;
    let launcher = WorkerLauncher::new(
        env!("CARGO_BIN_EXE_livescribe"),
        WorkerSettings::from_config(&config),
    );
    ModelSupervisor::new(
        Catalog::builtin(),
        launcher,
        SupervisorSettings {
            stop_timeout,
            startup_timeout: Duration::from_secs(10),
        },
    )
}

fn process_exists(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence and permission.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn audio(samples: &[i16], sample_rate: u32) -> WorkerInput {
    WorkerInput::Audio(AudioFrame {
        session_id: Some("s-1".to_string()),
        chunk: AudioChunk::from_samples(samples, sample_rate),
    })
}

#[tokio::test]
async fn test_switch_replaces_worker_process() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));

    let first = supervisor.start_model("loopback-streaming").await.unwrap();
    assert!(first.changed);
    assert_eq!(first.previous, None);
    let first_pid = supervisor.status().pid.unwrap();
    assert!(process_exists(first_pid));

    let second = supervisor.start_model("loopback-buffered").await.unwrap();
    assert!(second.changed);
    assert_eq!(second.previous.as_deref(), Some("loopback-streaming"));
    assert_eq!(second.current, "loopback-buffered");

    let status = supervisor.status();
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(status.model.as_deref(), Some("loopback-buffered"));
    assert_ne!(status.pid, Some(first_pid));
    assert!(!process_exists(first_pid));
    assert!(supervisor.get_active_queues("loopback-streaming").is_none());
    assert!(supervisor.get_active_queues("loopback-buffered").is_some());

    supervisor.stop_current_model().await;
}

#[tokio::test]
async fn test_restart_same_model_is_noop() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));

    supervisor.start_model("loopback-streaming").await.unwrap();
    let pid = supervisor.status().pid;
    let generation = supervisor.status().generation;

    let again = supervisor.start_model("loopback-streaming").await.unwrap();
    assert!(!again.changed);
    assert_eq!(supervisor.status().pid, pid);
    assert_eq!(supervisor.status().generation, generation);

    supervisor.stop_current_model().await;
}

#[tokio::test]
async fn test_concurrent_starts_are_serialized() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));

    let mut changes = supervisor.subscribe();
    let watcher = tokio::spawn(async move {
        let mut pids = Vec::new();
        while changes.changed().await.is_ok() {
            if let Some(pid) = changes.borrow_and_update().as_ref().and_then(|w| w.pid) {
                pids.push(pid);
            }
        }
        pids
    });

    let (a, b) = tokio::join!(
        supervisor.start_model("loopback-streaming"),
        supervisor.start_model("loopback-buffered")
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.changed && b.changed);

    // One start ran entirely before the other.
    let last = match (&a.previous, &b.previous) {
        (None, Some(previous)) => {
            assert_eq!(previous, &a.current);
            b.current.clone()
        }
        (Some(previous), None) => {
            assert_eq!(previous, &b.current);
            a.current.clone()
        }
        other => panic!("starts interleaved: {other:?}"),
    };

    let status = supervisor.status();
    assert_eq!(status.state, WorkerState::Running);
    assert_eq!(status.model.as_deref(), Some(last.as_str()));
    assert_eq!(supervisor.current_model(), Some(last.as_str()));
    assert_eq!(status.generation, 2);
    let pid = status.pid.unwrap();
    assert!(process_exists(pid));

    supervisor.stop_current_model().await;
    drop(supervisor);
    let pids = tokio::time::timeout(RECV_TIMEOUT, watcher).await.unwrap().unwrap();
    assert!(pids.contains(&pid));
    let earlier: Vec<u32> = pids.iter().copied().filter(|p| *p != pid).collect();
    assert!(earlier.len() <= 1);
    assert!(earlier.iter().all(|p| !process_exists(*p)));
}

#[tokio::test]
async fn test_unknown_model_keeps_current_worker() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));
    supervisor.start_model("loopback-streaming").await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    let err = supervisor.start_model("no-such-model").await.unwrap_err();
    assert_eq!(err.code(), "unknown_model");

    assert_eq!(supervisor.current_model(), Some("loopback-streaming"));
    assert_eq!(supervisor.status().pid, Some(pid));
    assert!(process_exists(pid));

    let queues = supervisor.get_active_queues("loopback-streaming").unwrap();
    queues.input.put_nowait(audio(&[8000; 1600], 16000)).unwrap();
    let result = queues.output.recv_timeout(RECV_TIMEOUT).await.unwrap();
    assert_eq!(result.text, "speech");

    supervisor.stop_current_model().await;
}

#[tokio::test]
async fn test_hung_worker_is_killed_within_timeout() {
    let dir = TempDir::new().unwrap();
    let timeout = Duration::from_millis(300);
    let supervisor = supervisor(&dir, timeout);
    supervisor.start_model("loopback-streaming").await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    // SAFETY: pid is our own child; SIGSTOP freezes it so Stop goes unanswered.
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGSTOP) }, 0);

    let started = Instant::now();
    let outcome = supervisor.stop_current_model().await;
    let elapsed = started.elapsed();

    assert_eq!(outcome, Some(StopOutcome::Killed));
    assert!(elapsed < timeout + Duration::from_secs(2), "took {elapsed:?}");
    assert!(!process_exists(pid));
    assert_eq!(supervisor.status().state, WorkerState::Stopped);
    assert!(supervisor.get_active_queues("loopback-streaming").is_none());
}

#[tokio::test]
async fn test_graceful_stop_exits_cleanly() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));
    supervisor.start_model("loopback-buffered").await.unwrap();
    let pid = supervisor.status().pid.unwrap();

    assert_eq!(supervisor.stop_current_model().await, Some(StopOutcome::Exited));
    assert!(!process_exists(pid));
    assert_eq!(supervisor.stop_current_model().await, None);
}

#[tokio::test]
async fn test_worker_survives_bad_item() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));
    supervisor.start_model("loopback-streaming").await.unwrap();
    let queues = supervisor.get_active_queues("loopback-streaming").unwrap();

    queues.input.put_nowait(audio(&[8000; 800], 8000)).unwrap();
    let failure = queues.output.recv_timeout(RECV_TIMEOUT).await.unwrap();
    assert!(failure.error.is_some());
    assert_eq!(failure.session_id.as_deref(), Some("s-1"));

    queues.input.put_nowait(audio(&[8000; 1600], 16000)).unwrap();
    let result = queues.output.recv_timeout(RECV_TIMEOUT).await.unwrap();
    assert!(result.error.is_none());
    assert_eq!(result.text, "speech");
    assert_eq!(supervisor.status().state, WorkerState::Running);

    supervisor.stop_current_model().await;
}

#[tokio::test]
async fn test_missing_artifacts_run_degraded() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));

    let switch = supervisor.start_model("vosk-en").await.unwrap();
    assert!(switch.changed);
    let status = supervisor.status();
    assert_eq!(status.state, WorkerState::Running);
    assert!(!status.loaded);

    let queues = supervisor.get_active_queues("vosk-en").unwrap();
    queues.input.put_nowait(audio(&[8000; 1600], 16000)).unwrap();
    assert!(
        queues
            .output
            .recv_timeout(Duration::from_millis(300))
            .await
            .is_none()
    );

    supervisor.stop_current_model().await;
}

#[tokio::test]
async fn test_killed_worker_is_reported_stopped() {
    let dir = TempDir::new().unwrap();
    let supervisor = supervisor(&dir, Duration::from_secs(5));
    supervisor.start_model("loopback-streaming").await.unwrap();
    let pid = supervisor.status().pid.unwrap();
    let queues = supervisor.get_active_queues("loopback-streaming").unwrap();

    // SAFETY: pid is our own child.
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) }, 0);

    assert!(queues.output.recv_timeout(RECV_TIMEOUT).await.is_none());
    assert_eq!(supervisor.status().state, WorkerState::Stopped);
    assert!(supervisor.get_active_queues("loopback-streaming").is_none());

    let restart = supervisor.start_model("loopback-streaming").await.unwrap();
    assert!(restart.changed);
    assert_ne!(supervisor.status().pid, Some(pid));
    supervisor.stop_current_model().await;
}
