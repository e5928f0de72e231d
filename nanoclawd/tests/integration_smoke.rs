//! Smoke integration tests for nanoclawd.
//!
//! These tests spawn the actual nanoclawd binary on a random port with a
//! minimal config (no Postgres, scheduler disabled), then verify the control
//! plane responds correctly. No Docker, no Postgres, no Telegram — pure HTTP
//! endpoint validation.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

/// Find a free port by binding to :0 and reading the assigned port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

/// Write a minimal config TOML to a temp file (no Postgres, scheduler disabled).
fn write_test_config(dir: &tempfile::TempDir, port: u16) -> PathBuf {
    let config_path = dir.path().join("test.toml");
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[storage]
ipc_dir = "ipc"

[runtimes]
default_runtime = "claude"

[runtimes.profiles.claude]
provider = "anthropic"
default_model = "claude-opus-4-6"
required_env = []

[orchestrator]
max_concurrent_containers = 3
assistant_name = "TestBot"

[scheduler]
enabled = false
"#
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

/// Build the nanoclawd binary (debug mode) and return its path.
fn nanoclawd_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "nanoclawd", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/nanoclawd")
}

/// Spawn nanoclawd and wait for it to be ready.
struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(config_path: &PathBuf, port: u16) -> Self {
        let binary = nanoclawd_binary();
        let child = Command::new(&binary)
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .env("RUST_LOG", "warn")
            .env("ASSISTANT_NAME", "TestBot")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn nanoclawd");

        let base_url = format!("http://127.0.0.1:{port}");

        let server = TestServer { child, base_url };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let client = reqwest::blocking::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/healthz", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("nanoclawd did not become ready within 5 seconds");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Send SIGTERM for graceful shutdown
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
        }
        let _ = self.child.wait();
    }
}

#[test]
fn healthz_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .expect("GET /healthz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "nanoclawd");
    assert!(body["uptime_seconds"].is_number());
}

#[test]
fn readyz_reports_orchestrator_disabled_without_postgres() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/readyz", server.base_url))
        .send()
        .expect("GET /readyz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["orchestrator_enabled"], false);
    assert_eq!(body["postgres_connected"], false);
    assert_eq!(body["registered_chats"], 0);
    assert_eq!(body["active_sandboxes"], 0);
    assert_eq!(body["runtime_profiles"], 1);
}

#[test]
fn config_endpoint_returns_resolved_config() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/v1/config", server.base_url))
        .send()
        .expect("GET /v1/config");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["orchestrator"]["assistant_name"], "TestBot");
    assert_eq!(body["server"]["bind"], format!("127.0.0.1:{port}"));
}

#[test]
fn shutdown_endpoint_stops_the_server() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let mut server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .post(format!("{}/v1/shutdown", server.base_url))
        .send()
        .expect("POST /v1/shutdown");
    assert_eq!(resp.status(), 200);

    let mut exited = false;
    for _ in 0..50 {
        if server.child.try_wait().expect("try_wait").is_some() {
            exited = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(exited, "server did not exit after /v1/shutdown");
}

#[test]
fn print_config_emits_valid_json() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let binary = nanoclawd_binary();

    let output = Command::new(&binary)
        .args(["print-config", "--config", config.to_str().unwrap()])
        .output()
        .expect("run print-config");

    assert!(output.status.success());
    let body: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("print-config output is valid JSON");
    assert_eq!(body["orchestrator"]["assistant_name"], "TestBot");
    assert_eq!(body["runtimes"]["default_runtime"], "claude");
}
