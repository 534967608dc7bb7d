#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use gw_chunked::compress_json;
use gw_transport::{MethodInvoker, MethodRequest, MethodResult};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

/// 按脚本顺序返回结果的方法调用桩。
#[derive(Default)]
pub struct ScriptedInvoker {
    replies: Mutex<VecDeque<MethodResult>>,
    pub requests: Mutex<Vec<(String, MethodRequest)>>,
}

impl ScriptedInvoker {
    pub fn new(replies: Vec<MethodResult>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl MethodInvoker for ScriptedInvoker {
    async fn invoke_method(&self, target: &str, request: MethodRequest) -> MethodResult {
        self.requests
            .lock()
            .unwrap()
            .push((target.to_string(), request));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MethodResult::new(500, json!({ "error": { "code": "NoReply" } })))
    }
}

pub fn accepted(request_id: &str) -> MethodResult {
    MethodResult::new(202, json!({ "RequestId": request_id }))
}

pub fn processing() -> MethodResult {
    MethodResult::new(102, json!({}))
}

pub fn completed(body: &Value) -> MethodResult {
    let encoded = general_purpose::STANDARD.encode(compress_json(body).unwrap());
    MethodResult::new(200, json!({ "Status": 200, "Payload": encoded }))
}
