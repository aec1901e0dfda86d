use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on a single wire frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message kinds exchanged over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Submit,
    QueryQueue,
    QueryQueueAll,
    DeleteTask,
    DeleteAll,
    GetTaskInfo,
    GetTaskLog,
    Shutdown,
    Ok,
    Error,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::Submit => "SUBMIT",
            MsgType::QueryQueue => "QUERY_QUEUE",
            MsgType::QueryQueueAll => "QUERY_QUEUE_ALL",
            MsgType::DeleteTask => "DELETE_TASK",
            MsgType::DeleteAll => "DELETE_ALL",
            MsgType::GetTaskInfo => "GET_TASK_INFO",
            MsgType::GetTaskLog => "GET_TASK_LOG",
            MsgType::Shutdown => "SHUTDOWN",
            MsgType::Ok => "OK",
            MsgType::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "SUBMIT" => MsgType::Submit,
            "QUERY_QUEUE" => MsgType::QueryQueue,
            "QUERY_QUEUE_ALL" => MsgType::QueryQueueAll,
            "DELETE_TASK" => MsgType::DeleteTask,
            "DELETE_ALL" => MsgType::DeleteAll,
            "GET_TASK_INFO" => MsgType::GetTaskInfo,
            "GET_TASK_LOG" => MsgType::GetTaskLog,
            "SHUTDOWN" => MsgType::Shutdown,
            "OK" => MsgType::Ok,
            "ERROR" => MsgType::Error,
            _ => return None,
        })
    }
}

/// The JSON object inside each frame: a type tag plus a payload that may
/// arrive either as an inline object or as a string of nested JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(msg_type: MsgType, payload: Value) -> Self {
        Self {
            msg_type: msg_type.as_str().to_string(),
            payload,
        }
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::parse(&self.msg_type)
    }

    /// Normalize the payload: string payloads are parsed as embedded JSON,
    /// a missing payload reads as an empty object.
    pub fn payload_value(&self) -> Result<Value, serde_json::Error> {
        match &self.payload {
            Value::String(s) => serde_json::from_str(s),
            Value::Null => Ok(Value::Object(Default::default())),
            other => Ok(other.clone()),
        }
    }
}

fn one() -> i64 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub script_path: String,
    pub workdir: String,
    #[serde(default = "one")]
    pub ncpu: i64,
    #[serde(default = "one")]
    pub ngpu: i64,
    #[serde(default)]
    pub specific_cpus: Vec<u32>,
    #[serde(default)]
    pub specific_gpus: Vec<u32>,
    #[serde(default)]
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub task_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub results: Vec<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteAllResponse {
    pub deleted_count: u64,
    pub running_terminated: u64,
    pub pending_deleted: u64,
    pub completed_deleted: u64,
}

/// One row of a queue listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: u64,
    pub status: String,
    pub script: String,
    pub workdir: String,
    pub cpus: Vec<u32>,
    pub gpus: Vec<u32>,
    pub exit_code: i32,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueResponse {
    pub running: Vec<TaskSummary>,
    pub pending: Vec<TaskSummary>,
    pub completed: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfoRequest {
    pub task_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDetailResponse {
    pub found: bool,
    pub id: u64,
    pub status: String,
    pub script: String,
    pub workdir: String,
    pub ncpu: u32,
    pub ngpu: u32,
    pub specific_cpus: Vec<u32>,
    pub specific_gpus: Vec<u32>,
    pub allocated_cpus: Vec<u32>,
    pub allocated_gpus: Vec<u32>,
    pub log_file: String,
    pub exit_code: i32,
    pub pid: u32,
    pub submit_time: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogRequest {
    pub task_id: u64,
    /// 0 means the whole file.
    #[serde(default)]
    pub tail_lines: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskLogResponse {
    pub task_id: u64,
    pub found: bool,
    pub log_path: String,
    pub content: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i32,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn msg_type_round_trips() {
        for t in [
            MsgType::Submit,
            MsgType::QueryQueue,
            MsgType::QueryQueueAll,
            MsgType::DeleteTask,
            MsgType::DeleteAll,
            MsgType::GetTaskInfo,
            MsgType::GetTaskLog,
            MsgType::Shutdown,
            MsgType::Ok,
            MsgType::Error,
        ] {
            assert_eq!(MsgType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MsgType::parse("NOPE"), None);
    }

    #[test]
    fn envelope_accepts_inline_object_payload() {
        let raw = json!({"type": "SUBMIT", "payload": {"script_path": "/a.sh", "workdir": "/w"}});
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.msg_type(), Some(MsgType::Submit));

        let req: SubmitRequest =
            serde_json::from_value(envelope.payload_value().unwrap()).unwrap();
        assert_eq!(req.script_path, "/a.sh");
        assert_eq!(req.ncpu, 1);
        assert_eq!(req.ngpu, 1);
    }

    #[test]
    fn envelope_accepts_string_embedded_payload() {
        let raw = json!({
            "type": "DELETE_TASK",
            "payload": "{\"task_ids\": [3, 4]}"
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        let req: DeleteRequest =
            serde_json::from_value(envelope.payload_value().unwrap()).unwrap();
        assert_eq!(req.task_ids, vec![3, 4]);
    }

    #[test]
    fn missing_payload_normalizes_to_empty_object() {
        let envelope: Envelope = serde_json::from_value(json!({"type": "SHUTDOWN"})).unwrap();
        assert_eq!(
            envelope.payload_value().unwrap(),
            Value::Object(Default::default())
        );
    }

    #[test]
    fn bad_string_payload_is_a_parse_error() {
        let envelope = Envelope::new(MsgType::Submit, Value::String("not json".into()));
        assert!(envelope.payload_value().is_err());
    }
}
