use crate::errors::{AppError, AppResult};
use crate::models::{
    CodeAssistPayload, GetTutorialPayload, HelperStatus, ModelKeyPayload, OutboundRequest, RunCodePayload,
    WindowAction,
};
use crate::redaction::Redactor;
use crate::supervisor::Supervisor;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

/// Native window chrome, kept behind a trait so the bridge runs headless.
pub trait WindowControl: Send + Sync {
    fn minimize(&self) -> AppResult<()>;
    fn toggle_maximize(&self) -> AppResult<()>;
    fn close(&self) -> AppResult<()>;
}

/// Window stand-in for the console host: closing wakes whoever is waiting on
/// [`HeadlessWindow::closed`].
#[derive(Debug, Default)]
pub struct HeadlessWindow {
    closed: Notify,
}

impl HeadlessWindow {
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

impl WindowControl for HeadlessWindow {
    fn minimize(&self) -> AppResult<()> {
        tracing::debug!("minimize requested on headless window");
        Ok(())
    }

    fn toggle_maximize(&self) -> AppResult<()> {
        tracing::debug!("maximize requested on headless window");
        Ok(())
    }

    fn close(&self) -> AppResult<()> {
        self.closed.notify_one();
        Ok(())
    }
}

/// The single entry point the UI uses to reach the helper.
pub struct IpcFacade {
    supervisor: Arc<Supervisor>,
    window: Arc<dyn WindowControl>,
    redactor: Redactor,
}

impl IpcFacade {
    pub fn new(supervisor: Arc<Supervisor>, window: Arc<dyn WindowControl>) -> Self {
        Self {
            supervisor,
            window,
            redactor: Redactor::new(true),
        }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Sends `command` to the helper and waits for its response, starting the
    /// helper first when needed. Write failures reject at once; nothing is
    /// retried. The request timeout covers the write as well as the wait, so
    /// a helper that stops draining stdin cannot wedge the caller.
    pub async fn invoke(&self, command: &str, payload: Value) -> AppResult<Value> {
        let channel = self.supervisor.ensure_running().await?;
        let request_id = Uuid::new_v4().to_string();
        tracing::debug!(
            request_id = %request_id,
            command = %command,
            generation = channel.generation(),
            payload = %self.redactor.redact_json(&payload),
            "sending request to helper"
        );
        let line = OutboundRequest {
            command: command.to_string(),
            payload,
            request_id: request_id.clone(),
        }
        .to_line()?;

        let call = channel.register(&request_id, command).await?;
        let budget = channel.correlator().timeout();
        let written = match timeout(budget, channel.write_line(&line)).await {
            Ok(written) => written,
            Err(_) => Err(AppError::Timeout(format!(
                "request {} ({}) could not be written within {} ms",
                request_id,
                command,
                budget.as_millis()
            ))),
        };
        if let Err(error) = written {
            tracing::warn!(request_id = %request_id, command = %command, error = %error, "request write failed");
            channel.correlator().reject(&request_id, error.clone()).await;
            return Err(error);
        }

        call.settled().await
    }

    pub async fn get_tutorials(&self) -> AppResult<Value> {
        self.invoke("get_tutorials", json!({})).await
    }

    pub async fn get_tutorial(&self, tutorial_key: &str) -> AppResult<Value> {
        let payload = GetTutorialPayload {
            tutorial_key: tutorial_key.to_string(),
        };
        self.invoke("get_tutorial", serde_json::to_value(payload)?).await
    }

    pub async fn run_code(&self, payload: RunCodePayload) -> AppResult<Value> {
        self.invoke("run_code", serde_json::to_value(payload)?).await
    }

    pub async fn get_hint(&self, payload: CodeAssistPayload) -> AppResult<Value> {
        self.invoke("get_hint", serde_json::to_value(payload)?).await
    }

    pub async fn get_solution(&self, payload: CodeAssistPayload) -> AppResult<Value> {
        self.invoke("get_solution", serde_json::to_value(payload)?).await
    }

    pub async fn model_key(&self, payload: ModelKeyPayload) -> AppResult<Value> {
        if payload.operate.trim().is_empty() {
            return Err(AppError::Protocol("model_key requires an operate field".to_string()));
        }
        self.invoke("model_key", serde_json::to_value(payload)?).await
    }

    /// Closing tears the helper down before the window goes away.
    pub async fn window_control(&self, action: WindowAction) -> AppResult<()> {
        match action {
            WindowAction::Minimize => self.window.minimize(),
            WindowAction::Maximize => self.window.toggle_maximize(),
            WindowAction::Close => {
                self.supervisor.terminate().await;
                self.window.close()
            }
        }
    }

    pub async fn restart_helper(&self) -> AppResult<HelperStatus> {
        self.supervisor.restart().await
    }

    pub async fn helper_status(&self) -> HelperStatus {
        self.supervisor.status().await
    }

    /// Returns whether the application should quit. macOS keeps running with
    /// no windows, so the helper is left alone there.
    pub async fn on_all_windows_closed(&self, is_macos: bool) -> bool {
        if is_macos {
            return false;
        }
        self.supervisor.terminate().await;
        true
    }

    pub async fn on_quit(&self) {
        self.supervisor.terminate().await;
    }
}
