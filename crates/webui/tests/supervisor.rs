#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::StubBackend;
use jobs::ThreadRegistry;
use webui::{BackendLauncher, ProcessConfig, ProcessSupervisor};

const SIGTERM: i32 = 15;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into()]
}

fn supervisor(command: Vec<String>, base_url: &str) -> (Arc<ThreadRegistry>, ProcessSupervisor) {
    let registry = Arc::new(ThreadRegistry::new());
    let sup = ProcessSupervisor::new(
        ProcessConfig {
            command,
            working_dir: None,
            env: BTreeMap::new(),
            base_url: base_url.into(),
            health_timeout: Duration::from_millis(500),
        },
        Arc::clone(&registry),
    );
    (registry, sup)
}

fn wait_for_output(sup: &ProcessSupervisor, needle: &str) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if sup.recent_output(50).iter().any(|line| line.contains(needle)) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn start_is_idempotent_and_stop_finalizes() {
    let (registry, sup) = supervisor(sh("echo booting; exec sleep 30"), "http://127.0.0.1:9");

    let first = sup.start().unwrap();
    assert!(first.running);
    assert!(first.start_time.is_some());
    let second = sup.start().unwrap();
    assert_eq!(first.pid, second.pid);

    assert!(wait_for_output(&sup, "[stdout] booting"));

    let start = Instant::now();
    assert!(sup.stop(Duration::from_secs(5)));
    assert!(start.elapsed() < Duration::from_secs(5));
    let status = sup.get_status();
    assert!(!status.running);
    assert_eq!(status.pid, None);
    assert_eq!(status.last_exit_code, Some(-SIGTERM));
    assert!(registry.get_active_threads().is_empty());

    assert!(sup.stop(Duration::from_secs(1)));
}

#[test]
fn stop_reaches_grandchildren() {
    let (_registry, sup) = supervisor(sh("sleep 30 & echo spawned; wait"), "http://127.0.0.1:9");
    sup.start().unwrap();
    assert!(wait_for_output(&sup, "spawned"));

    let start = Instant::now();
    assert!(sup.stop(Duration::from_secs(5)));
    // Readers only finish once every holder of the pipes is gone.
    assert!(start.elapsed() < Duration::from_secs(4));
}

#[test]
fn exit_code_is_recorded_when_process_dies_alone() {
    let (_registry, sup) = supervisor(sh("echo bye >&2; exit 4"), "http://127.0.0.1:9");
    sup.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while sup.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(!sup.is_running());
    let status = sup.get_status();
    assert_eq!(status.last_exit_code, Some(4));
    assert!(sup.recent_output(10).iter().any(|l| l == "[stderr] bye"));
}

#[test]
fn env_and_working_dir_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(ThreadRegistry::new());
    let sup = ProcessSupervisor::new(
        ProcessConfig {
            command: sh("echo \"args=$COMMANDLINE_ARGS\"; pwd; exec sleep 30"),
            working_dir: Some(PathBuf::from(dir.path())),
            env: BTreeMap::from([("COMMANDLINE_ARGS".to_string(), "--api --listen".to_string())]),
            base_url: "http://127.0.0.1:9".into(),
            health_timeout: Duration::from_millis(200),
        },
        registry,
    );
    sup.start().unwrap();

    assert!(wait_for_output(&sup, "args=--api --listen"));
    let dir_name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(wait_for_output(&sup, &dir_name));
    assert!(sup.stop(Duration::from_secs(2)));
}

#[test]
fn ensure_running_reports_backend_health() {
    let stub = StubBackend::ready();
    let (_registry, sup) = supervisor(vec!["sleep".into(), "30".into()], &stub.base_url);

    assert!(sup.ensure_running());
    assert!(sup.get_status().running);
    // Already running and healthy: no restart.
    let pid = sup.get_status().pid;
    assert!(sup.ensure_running());
    assert_eq!(sup.get_status().pid, pid);
    assert!(sup.stop(Duration::from_secs(2)));
}

#[test]
fn supervisor_works_as_a_launcher() {
    let (_registry, sup) = supervisor(sh("exec sleep 30"), "http://127.0.0.1:9");
    let sup = Arc::new(sup);
    let launcher: Arc<dyn BackendLauncher> = sup.clone();
    launcher.launch().unwrap();
    assert!(sup.get_status().running);
    assert!(sup.stop(Duration::from_secs(2)));
}
