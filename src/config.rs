use crate::errors::{AppError, AppResult};
use crate::harness::frame_extractor::{DEFAULT_MAX_FRAME_BUFFER_BYTES, DEFAULT_RETAIN_AFTER_TRIM_BYTES};
use crate::harness::stream_reassembler::DEFAULT_MAX_STREAM_CHUNKS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "code-tutor.yaml";
pub const RUN_MODE_ENV: &str = "CODE_TUTOR_RUN_MODE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Development,
    Packaged,
}

impl RunMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "packaged" | "production" | "prod" => Some(Self::Packaged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HelperConfig {
    /// Interpreter used to run `dev_script` in development mode.
    pub interpreter: String,
    /// Relative paths here and in `packaged_binaries` are resolved against
    /// `working_dir`, or the host executable's directory when that is unset.
    pub dev_script: PathBuf,
    /// Prebuilt helper executables, tried in order.
    pub packaged_binaries: Vec<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        let binary = if cfg!(windows) {
            "python_ipc_server.exe"
        } else {
            "python_ipc_server"
        };
        Self {
            interpreter: "python".to_string(),
            dev_script: PathBuf::from("python-server").join("ipc_server.py"),
            packaged_binaries: vec![
                PathBuf::from("resources").join(binary),
                PathBuf::from("resources")
                    .join("python-server")
                    .join("dist")
                    .join(binary),
            ],
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub run_mode: RunMode,
    pub data_dir: PathBuf,
    pub log_filter: String,
    pub request_timeout_ms: u64,
    pub max_frame_buffer_bytes: usize,
    pub frame_buffer_retain_bytes: usize,
    pub max_stream_chunks: usize,
    pub kill_verify_timeout_ms: u64,
    pub helper: HelperConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            run_mode: if cfg!(debug_assertions) {
                RunMode::Development
            } else {
                RunMode::Packaged
            },
            data_dir: PathBuf::from("data"),
            log_filter: "info".to_string(),
            request_timeout_ms: 60_000,
            max_frame_buffer_bytes: DEFAULT_MAX_FRAME_BUFFER_BYTES,
            frame_buffer_retain_bytes: DEFAULT_RETAIN_AFTER_TRIM_BYTES,
            max_stream_chunks: DEFAULT_MAX_STREAM_CHUNKS,
            kill_verify_timeout_ms: 1_500,
            helper: HelperConfig::default(),
        }
    }
}

/// One way of starting the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCandidate {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File that must exist for this candidate to be usable.
    pub requires: PathBuf,
}

impl HostConfig {
    /// Reads `path` when it exists; otherwise returns defaults. The run-mode
    /// environment variable wins over both.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|error| AppError::Config(format!("cannot read {}: {}", path.display(), error)))?;
            Self::from_yaml(&raw)?
        } else {
            Self::default()
        };

        if let Ok(value) = std::env::var(RUN_MODE_ENV) {
            match RunMode::parse(&value) {
                Some(mode) => config.run_mode = mode,
                None => tracing::warn!(value = %value, "ignoring unknown {}", RUN_MODE_ENV),
            }
        }

        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.request_timeout_ms == 0 {
            return Err(AppError::Config("requestTimeoutMs must be positive".to_string()));
        }
        if self.max_frame_buffer_bytes == 0 {
            return Err(AppError::Config("maxFrameBufferBytes must be positive".to_string()));
        }
        if self.max_stream_chunks == 0 {
            return Err(AppError::Config("maxStreamChunks must be positive".to_string()));
        }
        if self.frame_buffer_retain_bytes > self.max_frame_buffer_bytes {
            return Err(AppError::Config(
                "frameBufferRetainBytes cannot exceed maxFrameBufferBytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn kill_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_verify_timeout_ms)
    }

    /// Directory relative helper paths hang off: `helper.workingDir` when
    /// set, else the directory holding the host executable.
    pub fn helper_base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.helper.working_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Search order: the source script (development only), then each packaged
    /// binary. Every path is absolute once `helper_base_dir` is applied.
    pub fn launch_candidates(&self) -> Vec<LaunchCandidate> {
        let base = self.helper_base_dir();
        let mut candidates = Vec::new();
        if self.run_mode == RunMode::Development {
            let script = base.join(&self.helper.dev_script);
            let mut args = vec![script.to_string_lossy().to_string()];
            args.extend(self.helper.args.iter().cloned());
            candidates.push(LaunchCandidate {
                program: PathBuf::from(&self.helper.interpreter),
                args,
                requires: script,
            });
        }
        for binary in &self.helper.packaged_binaries {
            let binary = base.join(binary);
            candidates.push(LaunchCandidate {
                program: binary.clone(),
                args: self.helper.args.clone(),
                requires: binary,
            });
        }
        candidates
    }

    /// First candidate whose required file exists.
    pub fn resolve_launch(&self) -> AppResult<LaunchCandidate> {
        let candidates = self.launch_candidates();
        candidates
            .iter()
            .find(|candidate| candidate.requires.is_file())
            .cloned()
            .ok_or_else(|| {
                let searched = candidates
                    .iter()
                    .map(|candidate| candidate.requires.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                AppError::Launch(format!("cannot start helper: none of [{}] exists", searched))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::{HostConfig, RunMode};
    use crate::errors::AppError;
    use std::path::PathBuf;

    #[test]
    fn empty_yaml_yields_defaults() {
        let config = HostConfig::from_yaml("").expect("config");
        assert_eq!(config.request_timeout_ms, 60_000);
        assert_eq!(config.max_frame_buffer_bytes, 1024 * 1024);
        assert_eq!(config.helper.interpreter, "python");
    }

    #[test]
    fn partial_yaml_overrides_selected_fields() {
        let config = HostConfig::from_yaml(
            "runMode: packaged\nrequestTimeoutMs: 250\nhelper:\n  interpreter: python3\n",
        )
        .expect("config");
        assert_eq!(config.run_mode, RunMode::Packaged);
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.helper.interpreter, "python3");
        assert_eq!(config.helper.packaged_binaries.len(), 2);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = HostConfig::from_yaml("requestTimeoutMs: 0").expect_err("zero timeout");
        assert!(matches!(err, AppError::Config(_)));
        let err = HostConfig::from_yaml("runMode: [").expect_err("bad yaml");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn development_mode_tries_script_before_packaged_binaries() {
        let mut config = HostConfig::default();
        config.run_mode = RunMode::Development;
        let candidates = config.launch_candidates();
        assert_eq!(candidates.len(), 3);
        let base = config.helper_base_dir();
        assert_eq!(candidates[0].program, PathBuf::from("python"));
        assert_eq!(candidates[0].requires, base.join(&config.helper.dev_script));
        assert_eq!(candidates[1].program, base.join(&config.helper.packaged_binaries[0]));

        config.run_mode = RunMode::Packaged;
        assert_eq!(config.launch_candidates().len(), 2);
    }

    #[test]
    fn resolve_reports_every_searched_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = HostConfig::default();
        config.run_mode = RunMode::Development;
        config.helper.dev_script = dir.path().join("missing.py");
        config.helper.packaged_binaries = vec![dir.path().join("missing-bin")];
        let err = config.resolve_launch().expect_err("nothing exists");
        assert!(matches!(err, AppError::Launch(_)));
        assert!(err.to_string().contains("missing.py"));
        assert!(err.to_string().contains("missing-bin"));

        let script = dir.path().join("helper.py");
        std::fs::write(&script, "print('hi')").expect("write script");
        config.helper.dev_script = script.clone();
        assert_eq!(config.resolve_launch().expect("resolved").requires, script);
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("python-server")).expect("mkdir");
        let script = dir.path().join("python-server").join("ipc_server.py");
        std::fs::write(&script, "print('hi')").expect("write script");

        let mut config = HostConfig::default();
        config.run_mode = RunMode::Development;
        config.helper.working_dir = Some(dir.path().to_path_buf());

        let resolved = config.resolve_launch().expect("found under working dir");
        assert_eq!(resolved.requires, script);
        assert_eq!(resolved.args[0], script.to_string_lossy());
    }

    #[test]
    fn default_base_dir_is_the_executable_directory() {
        let config = HostConfig::default();
        let exe_dir = std::env::current_exe()
            .expect("exe")
            .parent()
            .expect("parent")
            .to_path_buf();
        assert_eq!(config.helper_base_dir(), exe_dir);
        assert!(config.launch_candidates().iter().all(|candidate| candidate.requires.is_absolute()));
    }

    #[test]
    fn zero_stream_chunk_cap_is_invalid() {
        let err = HostConfig::from_yaml("maxStreamChunks: 0").expect_err("zero cap");
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn run_mode_aliases_parse() {
        assert_eq!(RunMode::parse("dev"), Some(RunMode::Development));
        assert_eq!(RunMode::parse(" Production "), Some(RunMode::Packaged));
        assert_eq!(RunMode::parse("staging"), None);
    }
}
