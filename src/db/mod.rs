use crate::errors::{AppError, AppResult};
use crate::models::{code_editor_key, Theme, TutorialProgress, UserState};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const USER_STATE_KEY: &str = "user_state";

/// Host-side persistence for UI state. Nothing here reaches the helper.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_user_state()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn get_user_state(&self) -> AppResult<UserState> {
        let conn = self.lock()?;
        read_user_state(&conn)
    }

    /// Deep-merges `update` into the stored state. `null` leaves a field alone.
    pub fn update_user_state(&self, update: serde_json::Value) -> AppResult<UserState> {
        self.mutate(|state| {
            let mut merged = serde_json::to_value(&*state)?;
            merge_json_skip_null(&mut merged, update);
            *state = serde_json::from_value(merged)?;
            Ok(())
        })
    }

    pub fn current_tutorial(&self) -> AppResult<String> {
        Ok(self.get_user_state()?.current_tutorial)
    }

    pub fn set_current_tutorial(&self, tutorial_key: &str) -> AppResult<UserState> {
        self.mutate(|state| {
            state.current_tutorial = tutorial_key.to_string();
            Ok(())
        })
    }

    pub fn tutorial_progress(&self, tutorial_key: &str) -> AppResult<TutorialProgress> {
        Ok(self
            .get_user_state()?
            .tutorial_states
            .remove(tutorial_key)
            .unwrap_or_default())
    }

    /// Merges `patch` over the stored (or default) progress and stamps it.
    pub fn set_tutorial_progress(
        &self,
        tutorial_key: &str,
        patch: serde_json::Value,
    ) -> AppResult<TutorialProgress> {
        let mut updated = TutorialProgress::default();
        self.mutate(|state| {
            let current = state
                .tutorial_states
                .get(tutorial_key)
                .cloned()
                .unwrap_or_default();
            let mut merged = serde_json::to_value(current)?;
            merge_json_skip_null(&mut merged, patch);
            let mut progress: TutorialProgress = serde_json::from_value(merged)?;
            progress.last_updated = Utc::now();
            state
                .tutorial_states
                .insert(tutorial_key.to_string(), progress.clone());
            updated = progress;
            Ok(())
        })?;
        Ok(updated)
    }

    pub fn completed_exercises(&self) -> AppResult<Vec<String>> {
        Ok(self.get_user_state()?.completed_exercises)
    }

    pub fn add_completed_exercise(&self, exercise_id: &str) -> AppResult<Vec<String>> {
        let state = self.mutate(|state| {
            if !state.completed_exercises.iter().any(|id| id == exercise_id) {
                state.completed_exercises.push(exercise_id.to_string());
            }
            Ok(())
        })?;
        Ok(state.completed_exercises)
    }

    pub fn theme(&self) -> AppResult<Theme> {
        Ok(self.get_user_state()?.theme)
    }

    pub fn set_theme(&self, theme: Theme) -> AppResult<UserState> {
        self.mutate(|state| {
            state.theme = theme;
            Ok(())
        })
    }

    pub fn code_editor_content(&self, tutorial_key: &str, section_index: u32, block_index: u32) -> AppResult<String> {
        let key = code_editor_key(tutorial_key, section_index, block_index);
        Ok(self
            .get_user_state()?
            .code_editor_contents
            .remove(&key)
            .unwrap_or_default())
    }

    pub fn set_code_editor_content(
        &self,
        tutorial_key: &str,
        section_index: u32,
        block_index: u32,
        content: &str,
    ) -> AppResult<()> {
        let key = code_editor_key(tutorial_key, section_index, block_index);
        self.mutate(|state| {
            state.code_editor_contents.insert(key, content.to_string());
            Ok(())
        })?;
        Ok(())
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    /// Read-modify-write under one lock so concurrent setters do not race.
    fn mutate<F>(&self, apply: F) -> AppResult<UserState>
    where
        F: FnOnce(&mut UserState) -> AppResult<()>,
    {
        let conn = self.lock()?;
        let mut state = read_user_state(&conn)?;
        apply(&mut state)?;
        write_user_state(&conn, &state)?;
        Ok(state)
    }

    fn ensure_default_user_state(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            params![USER_STATE_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            write_user_state(&conn, &UserState::default())?;
        }
        Ok(())
    }
}

fn read_user_state(conn: &Connection) -> AppResult<UserState> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?1",
            params![USER_STATE_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match raw {
        Some(raw) => match serde_json::from_str::<UserState>(&raw) {
            Ok(state) => Ok(state),
            Err(error) => {
                tracing::warn!(error = %error, "stored user state unreadable, using defaults");
                Ok(UserState::default())
            }
        },
        None => Ok(UserState::default()),
    }
}

fn write_user_state(conn: &Connection, state: &UserState) -> AppResult<()> {
    conn.execute(
        "INSERT INTO settings (key, value_json, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
        params![USER_STATE_KEY, serde_json::to_string(state)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn merge_json_skip_null(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json_skip_null(
                    target_map.entry(key).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (_, serde_json::Value::Null) => {}
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::models::Theme;
    use serde_json::json;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("nested").join("state.sqlite")).expect("db");
        (dir, db)
    }

    #[test]
    fn fresh_database_has_default_state() {
        let (_dir, db) = open();
        let state = db.get_user_state().expect("state");
        assert_eq!(state.current_tutorial, "基础知识");
        assert_eq!(state.theme, Theme::Light);
        assert!(db.path().exists());
    }

    #[test]
    fn update_merges_and_ignores_nulls() {
        let (_dir, db) = open();
        db.set_current_tutorial("Python序列").expect("set tutorial");
        let state = db
            .update_user_state(json!({ "theme": "dark", "currentTutorial": null }))
            .expect("update");
        assert_eq!(state.theme, Theme::Dark);
        assert_eq!(state.current_tutorial, "Python序列");
    }

    #[test]
    fn invalid_update_is_rejected_without_writing() {
        let (_dir, db) = open();
        assert!(db.update_user_state(json!({ "theme": "purple" })).is_err());
        assert_eq!(db.theme().expect("theme"), Theme::Light);
    }

    #[test]
    fn tutorial_progress_merges_over_defaults() {
        let (_dir, db) = open();
        assert_eq!(db.tutorial_progress("文件操作").expect("default").current_section_index, 0);

        db.set_tutorial_progress("文件操作", json!({ "currentSectionIndex": 2 }))
            .expect("first");
        let progress = db
            .set_tutorial_progress("文件操作", json!({ "currentCodeBlockIndex": 5 }))
            .expect("second");
        assert_eq!(progress.current_section_index, 2);
        assert_eq!(progress.current_code_block_index, 5);
        assert_eq!(db.tutorial_progress("文件操作").expect("stored"), progress);
    }

    #[test]
    fn completed_exercises_are_deduplicated() {
        let (_dir, db) = open();
        db.add_completed_exercise("ex-1").expect("first");
        let completed = db.add_completed_exercise("ex-1").expect("again");
        assert_eq!(completed, vec!["ex-1".to_string()]);
    }

    #[test]
    fn code_editor_content_is_keyed_by_position() {
        let (_dir, db) = open();
        db.set_code_editor_content("基础知识", 1, 2, "print('hi')").expect("save");
        assert_eq!(db.code_editor_content("基础知识", 1, 2).expect("read"), "print('hi')");
        assert_eq!(db.code_editor_content("基础知识", 2, 1).expect("other"), "");
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.sqlite");
        Database::new(&path).expect("db").set_theme(Theme::Dark).expect("theme");
        assert_eq!(Database::new(&path).expect("reopen").theme().expect("theme"), Theme::Dark);
    }
}
