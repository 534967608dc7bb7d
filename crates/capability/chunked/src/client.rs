use crate::codec::{compress_json, decompress_json, encode_base64};
use crate::ChunkedCallError;
use api_contract::{ChunkedPollRequest, ChunkedResult, ChunkedSubmitRequest, adapter_error_code};
use gw_telemetry::{record_chunked_call, record_chunked_failure, record_chunked_poll};
use gw_transport::{MethodInvoker, MethodRequest, MethodResult};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STATUS_OK: u16 = 200;
const STATUS_ACCEPTED: u16 = 202;
const STATUS_PROCESSING: u16 = 102;

/// 单次分块调用的状态（仅用于日志）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedCallState {
    Submitted,
    InProgress,
    Complete,
    Failed,
}

/// 分块调用客户端。
///
/// 首次状态查询在受理后立即发出，之后每次查询前等待 `poll_interval`。
/// 默认不设总时限；设置 `max_poll_duration` 后超时返回 `Deadline`，服务端任务自行结束。
#[derive(Clone)]
pub struct ChunkedCallClient {
    invoker: Arc<dyn MethodInvoker>,
    target: String,
    poll_interval: Duration,
    max_poll_duration: Option<Duration>,
}

impl ChunkedCallClient {
    pub fn new(invoker: Arc<dyn MethodInvoker>, target: impl Into<String>) -> Self {
        Self {
            invoker,
            target: target.into(),
            poll_interval: Duration::from_secs(1),
            max_poll_duration: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_poll_duration(mut self, max_poll_duration: Option<Duration>) -> Self {
        self.max_poll_duration = max_poll_duration;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn invoker(&self) -> &Arc<dyn MethodInvoker> {
        &self.invoker
    }

    /// 执行一次分块调用，返回解压后的结果。
    pub async fn call(&self, method: &str, body: &Value) -> Result<Value, ChunkedCallError> {
        record_chunked_call();
        let result = self.run(method, body).await;
        let state = if result.is_ok() {
            ChunkedCallState::Complete
        } else {
            record_chunked_failure();
            ChunkedCallState::Failed
        };
        match &result {
            Ok(_) => info!(
                target: "gw.chunked",
                method = %method,
                state = ?state,
                "chunked_call_finished"
            ),
            Err(err) => warn!(
                target: "gw.chunked",
                method = %method,
                state = ?state,
                status = err.status(),
                error = %err,
                "chunked_call_finished"
            ),
        }
        result
    }

    async fn run(&self, method: &str, body: &Value) -> Result<Value, ChunkedCallError> {
        let compressed = compress_json(body)?;
        let submit = ChunkedSubmitRequest {
            content_length: compressed.len(),
            payload: encode_base64(&compressed),
        };
        let submit =
            serde_json::to_value(submit).map_err(|err| ChunkedCallError::Encode(err.to_string()))?;
        let accepted = self.invoke(method, submit).await;
        let request_id = accepted
            .payload
            .get("RequestId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let request_id = match (accepted.status, request_id) {
            (STATUS_ACCEPTED, Some(request_id)) => request_id,
            _ => return Err(rejected(method, &accepted)),
        };
        info!(
            target: "gw.chunked",
            method = %method,
            request_id = %request_id,
            content_length = compressed.len(),
            state = ?ChunkedCallState::Submitted,
            "chunked_call_accepted"
        );

        let poll = serde_json::to_value(ChunkedPollRequest {
            request_id: request_id.clone(),
        })
        .map_err(|err| ChunkedCallError::Encode(err.to_string()))?;
        let started = Instant::now();
        let mut first = true;
        let finished = loop {
            if !first {
                tokio::time::sleep(self.poll_interval).await;
            }
            first = false;
            if let Some(limit) = self.max_poll_duration {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Err(ChunkedCallError::Deadline {
                        method: method.to_string(),
                        elapsed,
                    });
                }
            }
            record_chunked_poll();
            let result = self.invoke(method, poll.clone()).await;
            debug!(
                target: "gw.chunked",
                method = %method,
                request_id = %request_id,
                status = result.status,
                state = ?ChunkedCallState::InProgress,
                "chunked_call_polled"
            );
            if result.status != STATUS_PROCESSING {
                break result;
            }
        };

        if finished.status == STATUS_OK {
            let inner: ChunkedResult =
                serde_json::from_value(finished.payload.clone()).unwrap_or_default();
            if let (Some(STATUS_OK), Some(payload)) = (inner.status, inner.payload.as_deref()) {
                if !payload.is_empty() {
                    return decompress_json(payload);
                }
            }
        }
        Err(rejected(method, &finished))
    }

    async fn invoke(&self, method: &str, payload: Value) -> MethodResult {
        self.invoker
            .invoke_method(&self.target, MethodRequest::new(method, payload))
            .await
    }
}

fn rejected(method: &str, result: &MethodResult) -> ChunkedCallError {
    let message = adapter_error_code(&result.payload).unwrap_or_else(|| {
        format!(
            "Unknown error in the chunked response from {} - status: {}",
            method, result.status
        )
    });
    ChunkedCallError::Rejected {
        status: failure_status(result),
        message,
        detail: result.payload.get("error").cloned(),
    }
}

/// 失败信封的 status 始终 >= 400：外层非错误时取内层 `Status`，否则为 500。
fn failure_status(result: &MethodResult) -> u16 {
    if result.status >= 400 {
        return result.status;
    }
    result
        .payload
        .get("Status")
        .and_then(Value::as_u64)
        .and_then(|status| u16::try_from(status).ok())
        .filter(|status| *status >= 400)
        .unwrap_or(500)
}
