use crate::config::HostConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::ipc::{IpcFacade, WindowControl};
use crate::models::{BooleanResponse, Theme, WindowAction};
use crate::supervisor::Supervisor;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub const DATABASE_FILE: &str = "code-tutor.sqlite";

#[derive(Debug, Deserialize)]
struct WindowControlPayload {
    action: WindowAction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TutorialKeyPayload {
    tutorial_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TutorialProgressPayload {
    tutorial_key: String,
    progress: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExercisePayload {
    exercise_id: String,
}

#[derive(Debug, Deserialize)]
struct ThemePayload {
    theme: Theme,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CodeSlotPayload {
    tutorial_key: String,
    section_index: u32,
    block_index: u32,
    #[serde(default)]
    content: Option<String>,
}

/// Host-side command router shared by every transport. Commands the host
/// does not own are forwarded to the helper unchanged.
#[derive(Clone)]
pub struct HostApp {
    facade: Arc<IpcFacade>,
    db: Arc<Database>,
}

impl HostApp {
    pub fn new(config: HostConfig, window: Arc<dyn WindowControl>) -> AppResult<Self> {
        let db = Database::new(&config.data_dir.join(DATABASE_FILE))?;
        let supervisor = Arc::new(Supervisor::new(config));
        Ok(Self::from_parts(IpcFacade::new(supervisor, window), db))
    }

    pub fn from_parts(facade: IpcFacade, db: Database) -> Self {
        Self {
            facade: Arc::new(facade),
            db: Arc::new(db),
        }
    }

    pub fn facade(&self) -> &IpcFacade {
        &self.facade
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub async fn handle(&self, command: &str, payload: Value) -> AppResult<Value> {
        match command {
            "window_control" => {
                let request: WindowControlPayload = parse_payload(command, payload)?;
                self.facade.window_control(request.action).await?;
                to_json(BooleanResponse { success: true })
            }
            "restart_helper" => to_json(self.facade.restart_helper().await?),
            "helper_status" => to_json(self.facade.helper_status().await),
            "settings_get" => to_json(self.db.get_user_state()?),
            "settings_update" => to_json(self.db.update_user_state(payload)?),
            "settings_set_current_tutorial" => {
                let request: TutorialKeyPayload = parse_payload(command, payload)?;
                to_json(self.db.set_current_tutorial(&request.tutorial_key)?)
            }
            "settings_get_tutorial_progress" => {
                let request: TutorialKeyPayload = parse_payload(command, payload)?;
                to_json(self.db.tutorial_progress(&request.tutorial_key)?)
            }
            "settings_set_tutorial_progress" => {
                let request: TutorialProgressPayload = parse_payload(command, payload)?;
                to_json(self.db.set_tutorial_progress(&request.tutorial_key, request.progress)?)
            }
            "settings_complete_exercise" => {
                let request: ExercisePayload = parse_payload(command, payload)?;
                to_json(self.db.add_completed_exercise(&request.exercise_id)?)
            }
            "settings_set_theme" => {
                let request: ThemePayload = parse_payload(command, payload)?;
                to_json(self.db.set_theme(request.theme)?)
            }
            "settings_get_code" => {
                let request: CodeSlotPayload = parse_payload(command, payload)?;
                let content =
                    self.db
                        .code_editor_content(&request.tutorial_key, request.section_index, request.block_index)?;
                Ok(json!({ "content": content }))
            }
            "settings_set_code" => {
                let request: CodeSlotPayload = parse_payload(command, payload)?;
                let content = request.content.ok_or_else(|| {
                    AppError::Protocol("settings_set_code requires content".to_string())
                })?;
                self.db.set_code_editor_content(
                    &request.tutorial_key,
                    request.section_index,
                    request.block_index,
                    &content,
                )?;
                to_json(BooleanResponse { success: true })
            }
            _ => self.facade.invoke(command, payload).await,
        }
    }

    pub async fn on_all_windows_closed(&self, is_macos: bool) -> bool {
        self.facade.on_all_windows_closed(is_macos).await
    }

    pub async fn shutdown(&self) {
        self.facade.on_quit().await;
    }
}

fn parse_payload<T: DeserializeOwned>(command: &str, payload: Value) -> AppResult<T> {
    serde_json::from_value(payload)
        .map_err(|error| AppError::Protocol(format!("invalid payload for {}: {}", command, error)))
}

fn to_json<T: serde::Serialize>(value: T) -> AppResult<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::HostApp;
    use crate::config::{HostConfig, RunMode};
    use crate::errors::AppError;
    use crate::ipc::HeadlessWindow;
    use serde_json::json;
    use std::sync::Arc;

    fn app() -> (tempfile::TempDir, HostApp) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = HostConfig::default();
        config.data_dir = dir.path().to_path_buf();
        config.run_mode = RunMode::Packaged;
        config.helper.packaged_binaries = vec![dir.path().join("no-helper")];
        let app = HostApp::new(config, Arc::new(HeadlessWindow::default())).expect("app");
        (dir, app)
    }

    #[tokio::test]
    async fn settings_commands_round_through_the_database() {
        let (_dir, app) = app();
        app.handle("settings_set_theme", json!({ "theme": "dark" }))
            .await
            .expect("theme");
        app.handle(
            "settings_set_code",
            json!({ "tutorialKey": "基础知识", "sectionIndex": 0, "blockIndex": 1, "content": "x = 1" }),
        )
        .await
        .expect("save code");

        let state = app.handle("settings_get", json!(null)).await.expect("state");
        assert_eq!(state["theme"], "dark");
        assert_eq!(state["codeEditorContents"]["基础知识-0-1"], "x = 1");

        let code = app
            .handle(
                "settings_get_code",
                json!({ "tutorialKey": "基础知识", "sectionIndex": 0, "blockIndex": 1 }),
            )
            .await
            .expect("read code");
        assert_eq!(code, json!({ "content": "x = 1" }));
    }

    #[tokio::test]
    async fn bad_host_payload_is_a_protocol_error() {
        let (_dir, app) = app();
        let err = app
            .handle("window_control", json!({ "action": "fullscreen" }))
            .await
            .expect_err("unknown action");
        assert!(matches!(err, AppError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_commands_go_to_the_helper() {
        let (_dir, app) = app();
        let err = app.handle("get_tutorials", json!({})).await.expect_err("no helper");
        assert!(matches!(err, AppError::Launch(_)));
    }

    #[tokio::test]
    async fn helper_status_reports_absent_before_first_use() {
        let (_dir, app) = app();
        let status = app.handle("helper_status", json!(null)).await.expect("status");
        assert_eq!(status["state"], "absent");
        assert_eq!(status["pendingRequests"], 0);
    }
}
