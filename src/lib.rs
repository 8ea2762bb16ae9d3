pub mod app;
pub mod config;
pub mod correlator;
pub mod db;
pub mod errors;
pub mod harness;
pub mod ipc;
pub mod models;
pub mod process_tree;
pub mod redaction;
pub mod router;
pub mod supervisor;

use crate::app::HostApp;
use crate::config::HostConfig;
use crate::ipc::HeadlessWindow;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// One line of the console transport.
#[derive(Debug, Deserialize)]
struct ConsoleRequest {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    payload: Value,
}

pub fn run() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = HostConfig::load(config_path.as_deref())?;
    std::fs::create_dir_all(&config.data_dir)?;
    init_tracing(&config.data_dir, &config.log_filter).map_err(anyhow::Error::msg)?;
    tracing::info!(
        run_mode = ?config.run_mode,
        data_dir = %config.data_dir.display(),
        "host starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let window = Arc::new(HeadlessWindow::default());
        let app = HostApp::new(config, window.clone())?;
        serve_console(app, window).await;
        anyhow::Ok(())
    })
}

/// Serves newline-delimited JSON commands on stdin until EOF, Ctrl-C or a
/// window close, then tears the helper down.
async fn serve_console(app: HostApp, window: Arc<HeadlessWindow>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = reply_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let app = app.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let reply = answer(&app, &line).await;
                        let _ = reply_tx.send(format!("{}\n", reply)).await;
                    });
                }
                Ok(None) => {
                    tracing::info!("console input closed");
                    break;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "console read failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = window.closed() => {
                tracing::info!("window closed");
                break;
            }
        }
    }

    app.shutdown().await;
    drop(reply_tx);
    let _ = writer.await;
    tracing::info!("host stopped");
}

async fn answer(app: &HostApp, line: &str) -> Value {
    let request: ConsoleRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(error) => {
            return json!({ "ok": false, "error": to_client_error(format!("invalid request line: {}", error)) });
        }
    };

    match app.handle(&request.command, request.payload).await {
        Ok(data) => json!({ "id": request.id, "ok": true, "data": data }),
        Err(error) => json!({ "id": request.id, "ok": false, "error": to_client_error(error) }),
    }
}

pub fn init_tracing(data_dir: &Path, default_filter: &str) -> Result<(), String> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "host.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_filter))
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

pub fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}

#[cfg(test)]
mod tests {
    use super::{answer, to_client_error};
    use crate::app::HostApp;
    use crate::config::{HostConfig, RunMode};
    use crate::errors::AppError;
    use crate::ipc::HeadlessWindow;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn client_errors_keep_their_code_prefix() {
        assert_eq!(
            to_client_error(AppError::Timeout("no response".to_string())),
            "TIMEOUT: no response"
        );
    }

    #[tokio::test]
    async fn console_answers_carry_the_request_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = HostConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.run_mode = RunMode::Packaged;
        config.helper.packaged_binaries = vec![dir.path().join("no-helper")];
        let app = HostApp::new(config, Arc::new(HeadlessWindow::default())).expect("app");

        let ok = answer(&app, r#"{"id":7,"command":"settings_get"}"#).await;
        assert_eq!(ok["id"], 7);
        assert_eq!(ok["ok"], true);
        assert_eq!(ok["data"]["theme"], "light");

        let failed = answer(&app, r#"{"id":"a","command":"get_tutorials","payload":{}}"#).await;
        assert_eq!(failed["ok"], false);
        assert!(failed["error"].as_str().expect("message").starts_with("LAUNCH_FAILED"));

        let garbage = answer(&app, "not json").await;
        assert_eq!(garbage["ok"], json!(false));
        assert!(garbage["error"].as_str().expect("message").contains("invalid request line"));
    }
}
