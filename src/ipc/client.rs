use crate::ipc::protocol::{
    DeleteAllResponse, DeleteRequest, DeleteResponse, Envelope, ErrorResponse, MsgType,
    QueueResponse, SubmitRequest, SubmitResponse, TaskDetailResponse, TaskInfoRequest,
    TaskLogRequest, TaskLogResponse,
};
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::path::Path;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Client side of the daemon socket.
pub struct IpcClient {
    framed: Framed<UnixStream, tokio_util::codec::LengthDelimitedCodec>,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(socket_path).await.with_context(|| {
            format!(
                "cannot connect to {} (is the server running?)",
                socket_path.display()
            )
        })?;
        Ok(Self {
            framed: Framed::new(stream, crate::ipc::frame_codec()),
        })
    }

    /// Send one request and read its response frame.
    pub async fn request(
        &mut self,
        msg_type: MsgType,
        payload: Value,
    ) -> anyhow::Result<(MsgType, Value)> {
        let bytes = serde_json::to_vec(&Envelope::new(msg_type, payload))?;
        self.framed
            .send(Bytes::from(bytes))
            .await
            .context("sending request")?;

        let frame = self
            .framed
            .next()
            .await
            .ok_or_else(|| anyhow!("connection closed before a response arrived"))?
            .context("receiving response")?;

        let envelope: Envelope = serde_json::from_slice(&frame).context("decoding response")?;
        let response_type = envelope
            .msg_type()
            .ok_or_else(|| anyhow!("unknown response type {:?}", envelope.msg_type))?;
        Ok((response_type, envelope.payload_value()?))
    }

    /// Request helper that unwraps `OK` payloads and turns `ERROR`
    /// responses into one-line errors.
    async fn expect_ok(&mut self, msg_type: MsgType, payload: Value) -> anyhow::Result<Value> {
        let (response_type, value) = self.request(msg_type, payload).await?;
        match response_type {
            MsgType::Ok => Ok(value),
            MsgType::Error => {
                let err: ErrorResponse = serde_json::from_value(value)
                    .unwrap_or_else(|_| ErrorResponse {
                        code: 0,
                        message: "malformed error response".into(),
                    });
                bail!("{} (code {})", err.message, err.code)
            }
            other => bail!("unexpected response type {}", other.as_str()),
        }
    }

    pub async fn submit(&mut self, request: &SubmitRequest) -> anyhow::Result<u64> {
        let value = self
            .expect_ok(MsgType::Submit, serde_json::to_value(request)?)
            .await?;
        let response: SubmitResponse = serde_json::from_value(value)?;
        Ok(response.task_id)
    }

    pub async fn query_queue(&mut self, all: bool) -> anyhow::Result<QueueResponse> {
        let msg_type = if all {
            MsgType::QueryQueueAll
        } else {
            MsgType::QueryQueue
        };
        let value = self.expect_ok(msg_type, Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn delete_tasks(&mut self, task_ids: Vec<u64>) -> anyhow::Result<Vec<bool>> {
        let request = DeleteRequest { task_ids };
        let value = self
            .expect_ok(MsgType::DeleteTask, serde_json::to_value(&request)?)
            .await?;
        let response: DeleteResponse = serde_json::from_value(value)?;
        Ok(response.results)
    }

    pub async fn delete_all(&mut self) -> anyhow::Result<DeleteAllResponse> {
        let value = self.expect_ok(MsgType::DeleteAll, Value::Null).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn task_info(&mut self, task_id: u64) -> anyhow::Result<TaskDetailResponse> {
        let request = TaskInfoRequest { task_id };
        let value = self
            .expect_ok(MsgType::GetTaskInfo, serde_json::to_value(&request)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn task_log(
        &mut self,
        task_id: u64,
        tail_lines: usize,
    ) -> anyhow::Result<TaskLogResponse> {
        let request = TaskLogRequest {
            task_id,
            tail_lines,
        };
        let value = self
            .expect_ok(MsgType::GetTaskLog, serde_json::to_value(&request)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.expect_ok(MsgType::Shutdown, Value::Null).await?;
        Ok(())
    }
}
