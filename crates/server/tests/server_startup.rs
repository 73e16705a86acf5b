use std::io::Write;
use std::net::TcpListener;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Create a minimal valid config
fn minimal_config(port: u16, db_path: &str) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = {}

[database]
path = "{}"

[control_plane]
url = "http://127.0.0.1:9"
api_token = "super-secret-token"
"#,
        port, db_path
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// Spawn the server and return a handle
async fn spawn_server(config_path: &std::path::Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_clusterback"))
        .env("CLUSTERBACK_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server")
}

/// Run the server to completion and report whether it exited cleanly
async fn run_to_exit(config_path: &std::path::Path) -> bool {
    timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_clusterback"))
            .env("CLUSTERBACK_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command")
    .status
    .success()
}

/// Wait for server to be ready
async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/api/v1/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_health_endpoint() {
    let port = get_available_port();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = write_config(&minimal_config(port, db_path.to_str().unwrap()));

    let mut server = spawn_server(config.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let response = Client::new()
        .get(format!("http://127.0.0.1:{}/api/v1/health", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["status"], "ok");

    server.kill().await.ok();
}

#[tokio::test]
async fn test_config_endpoint_hides_control_plane_token() {
    let port = get_available_port();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = write_config(&minimal_config(port, db_path.to_str().unwrap()));

    let mut server = spawn_server(config.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let response = Client::new()
        .get(format!("http://127.0.0.1:{}/api/v1/config", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let text = response.text().await.expect("Failed to read body");
    assert!(!text.contains("super-secret-token"));

    let json: serde_json::Value = serde_json::from_str(&text).expect("Failed to parse JSON");
    assert_eq!(json["server"]["port"], port);
    assert_eq!(json["control_plane"]["api_token_configured"], true);

    server.kill().await.ok();
}

#[tokio::test]
async fn test_worker_loop_runs_by_default() {
    let port = get_available_port();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = write_config(&minimal_config(port, db_path.to_str().unwrap()));

    let mut server = spawn_server(config.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let json: serde_json::Value = Client::new()
        .get(format!("http://127.0.0.1:{}/api/v1/orchestrator/status", port))
        .send()
        .await
        .expect("Failed to send request")
        .json()
        .await
        .expect("Failed to parse JSON");
    assert_eq!(json["running"], true);

    server.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    let temp_dir = TempDir::new().unwrap();
    let missing = temp_dir.path().join("nonexistent.toml");

    assert!(!run_to_exit(&missing).await);
}

#[tokio::test]
async fn test_missing_control_plane_exits_with_error() {
    let port = get_available_port();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = write_config(&format!(
        r#"
[server]
host = "127.0.0.1"
port = {}

[database]
path = "{}"
"#,
        port,
        db_path.to_str().unwrap()
    ));

    assert!(!run_to_exit(config.path()).await);
}

#[tokio::test]
async fn test_invalid_poll_settings_exit_with_error() {
    let port = get_available_port();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let config = write_config(&format!(
        "{}\n[orchestrator.poll]\nbase_interval_ms = 0\n",
        minimal_config(port, db_path.to_str().unwrap())
    ));

    assert!(!run_to_exit(config.path()).await);
}
