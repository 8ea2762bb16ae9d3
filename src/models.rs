use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const STATUS_ERROR: &str = "error";
pub const STATUS_STREAM_START: &str = "stream_start";
pub const STATUS_STREAM_CHUNK: &str = "stream_chunk";
pub const STATUS_STREAM_END: &str = "stream_end";

/// One request line written to the helper's stdin. Field order is part of the
/// wire format: `command`, `payload`, `requestId`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub command: String,
    pub payload: Value,
    pub request_id: String,
}

impl OutboundRequest {
    pub fn to_line(&self) -> AppResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// A frame peeled off the helper's stdout, classified once by its `status`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFrame {
    Success {
        request_id: Option<String>,
        status: String,
        body: Value,
    },
    Error {
        request_id: Option<String>,
        message: String,
    },
    StreamStart {
        request_id: String,
        total_chunks: usize,
    },
    StreamChunk {
        request_id: String,
        chunk_index: usize,
        chunk_data: String,
    },
    StreamEnd {
        request_id: String,
    },
}

impl ResponseFrame {
    pub fn decode(value: Value) -> AppResult<Self> {
        let Value::Object(mut object) = value else {
            return Err(AppError::Protocol("frame is not a JSON object".to_string()));
        };

        let status = match object.get("status") {
            Some(Value::String(status)) => status.clone(),
            Some(other) => {
                return Err(AppError::Protocol(format!("frame status is not a string: {}", other)));
            }
            None => return Err(AppError::Protocol("frame has no status field".to_string())),
        };
        let request_id = object
            .get("requestId")
            .and_then(Value::as_str)
            .map(str::to_string);

        match status.as_str() {
            STATUS_STREAM_START => {
                let request_id = require_request_id(request_id, &status)?;
                let total_chunks = require_index(&object, "total_chunks")?;
                Ok(Self::StreamStart {
                    request_id,
                    total_chunks,
                })
            }
            STATUS_STREAM_CHUNK => {
                let request_id = require_request_id(request_id, &status)?;
                let chunk_index = require_index(&object, "chunk_index")?;
                let chunk_data = object
                    .get("chunk_data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AppError::Protocol("stream_chunk without chunk_data".to_string()))?
                    .to_string();
                Ok(Self::StreamChunk {
                    request_id,
                    chunk_index,
                    chunk_data,
                })
            }
            STATUS_STREAM_END => Ok(Self::StreamEnd {
                request_id: require_request_id(request_id, &status)?,
            }),
            STATUS_ERROR => {
                let message = object
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("helper reported an error without a message")
                    .to_string();
                Ok(Self::Error {
                    request_id,
                    message,
                })
            }
            _ => {
                object.remove("requestId");
                Ok(Self::Success {
                    request_id,
                    status,
                    body: Value::Object(object),
                })
            }
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id.as_deref(),
            Self::StreamStart { request_id, .. }
            | Self::StreamChunk { request_id, .. }
            | Self::StreamEnd { request_id } => Some(request_id.as_str()),
        }
    }
}

fn require_request_id(request_id: Option<String>, status: &str) -> AppResult<String> {
    request_id.ok_or_else(|| AppError::Protocol(format!("{} frame without requestId", status)))
}

fn require_index(object: &Map<String, Value>, field: &str) -> AppResult<usize> {
    object
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|value| usize::try_from(value).ok())
        .ok_or_else(|| AppError::Protocol(format!("missing or invalid {}", field)))
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GetTutorialPayload {
    pub tutorial_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunCodePayload {
    pub code: String,
    #[serde(default)]
    pub expected_code: String,
}

/// Shared by the hint and solution commands.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeAssistPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub expected_code: String,
    #[serde(default)]
    pub actual_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelKeyPayload {
    pub operate: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowAction {
    Minimize,
    Maximize,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelperLifecycle {
    Absent,
    Starting,
    Running,
    Terminating,
}

impl HelperLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminating => "terminating",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelperStatus {
    pub state: HelperLifecycle,
    pub pid: Option<u32>,
    pub generation: u64,
    pub pending_requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Theme {
    Light,
    Dark,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TutorialProgress {
    pub current_section_index: u32,
    pub current_sub_section_index: u32,
    pub current_code_block_index: u32,
    pub section_code_block_index: u32,
    pub sub_section_code_block_index: u32,
    pub last_updated: DateTime<Utc>,
}

impl Default for TutorialProgress {
    fn default() -> Self {
        Self {
            current_section_index: 0,
            current_sub_section_index: 0,
            current_code_block_index: 0,
            section_code_block_index: 0,
            sub_section_code_block_index: 0,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct UserState {
    pub current_tutorial: String,
    pub tutorial_states: BTreeMap<String, TutorialProgress>,
    pub completed_exercises: Vec<String>,
    pub theme: Theme,
    pub code_editor_contents: BTreeMap<String, String>,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            current_tutorial: "基础知识".to_string(),
            tutorial_states: BTreeMap::new(),
            completed_exercises: Vec::new(),
            theme: Theme::Light,
            code_editor_contents: BTreeMap::new(),
        }
    }
}

pub fn code_editor_key(tutorial_key: &str, section_index: u32, block_index: u32) -> String {
    format!("{}-{}-{}", tutorial_key, section_index, block_index)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}
