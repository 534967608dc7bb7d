use crate::{BulkFetchError, ChunkedCallClient, ItemSink};
use api_contract::{FIRST_PAGE_TOKEN, FetchPageRequest, NodePage};
use gw_telemetry::record_page_fetched;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

pub const DEFAULT_START_METHOD: &str = "BrowseNodes_v1";
pub const DEFAULT_PAGE_METHOD: &str = "FetchBrowsedNodes_v1";

/// 服务端拉取任务。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFetchJob {
    pub job_id: String,
    pub continuation_token: Option<String>,
    pub page_count: u32,
}

/// 拉取结果摘要。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkFetchSummary {
    pub job_id: String,
    pub page_count: u32,
    pub item_count: usize,
}

/// 分页批量拉取。
#[derive(Clone)]
pub struct BulkFetch {
    client: ChunkedCallClient,
    start_method: String,
    page_method: String,
}

impl BulkFetch {
    pub fn new(client: ChunkedCallClient) -> Self {
        Self {
            client,
            start_method: DEFAULT_START_METHOD.to_string(),
            page_method: DEFAULT_PAGE_METHOD.to_string(),
        }
    }

    pub fn with_methods(mut self, start_method: impl Into<String>, page_method: impl Into<String>) -> Self {
        self.start_method = start_method.into();
        self.page_method = page_method.into();
        self
    }

    /// 启动拉取任务（本身是一次分块调用），返回任务 ID。
    pub async fn start<T: Serialize>(&self, request: &T) -> Result<BulkFetchJob, BulkFetchError> {
        let body =
            serde_json::to_value(request).map_err(|err| BulkFetchError::Page(err.to_string()))?;
        let accepted = self.client.call(&self.start_method, &body).await?;
        let job_id = accepted
            .get("JobId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BulkFetchError::MissingJobId(self.start_method.clone()))?;
        info!(target: "gw.chunked", job_id = %job_id, "bulk_fetch_started");
        Ok(BulkFetchJob {
            job_id: job_id.to_string(),
            continuation_token: None,
            page_count: 0,
        })
    }

    /// 逐页拉取直到令牌耗尽或出错；无论成败都会结束写入端。
    pub async fn drain<S>(&self, job: &mut BulkFetchJob, sink: &mut S) -> Result<BulkFetchSummary, BulkFetchError>
    where
        S: ItemSink + ?Sized,
    {
        sink.begin()
            .await
            .map_err(|err| BulkFetchError::Sink(err.to_string()))?;
        let fetched = self.fetch_pages(job, sink).await;
        let finished = sink.finish().await;
        let item_count = match fetched {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target: "gw.chunked",
                    job_id = %job.job_id,
                    page_count = job.page_count,
                    error = %err,
                    "bulk_fetch_aborted"
                );
                return Err(err);
            }
        };
        finished.map_err(|err| BulkFetchError::Sink(err.to_string()))?;
        info!(
            target: "gw.chunked",
            job_id = %job.job_id,
            page_count = job.page_count,
            item_count = item_count,
            "bulk_fetch_finished"
        );
        Ok(BulkFetchSummary {
            job_id: job.job_id.clone(),
            page_count: job.page_count,
            item_count,
        })
    }

    async fn fetch_pages<S>(&self, job: &mut BulkFetchJob, sink: &mut S) -> Result<usize, BulkFetchError>
    where
        S: ItemSink + ?Sized,
    {
        let mut item_count = 0;
        loop {
            let token = job
                .continuation_token
                .clone()
                .unwrap_or_else(|| FIRST_PAGE_TOKEN.to_string());
            let request = FetchPageRequest {
                job_id: job.job_id.clone(),
                continuation_token: token,
            };
            let body =
                serde_json::to_value(request).map_err(|err| BulkFetchError::Page(err.to_string()))?;
            let page = self.client.call(&self.page_method, &body).await?;
            let page: NodePage =
                serde_json::from_value(page).map_err(|err| BulkFetchError::Page(err.to_string()))?;
            job.page_count += 1;
            record_page_fetched();
            for node in &page.nodes {
                sink.write_item(node)
                    .await
                    .map_err(|err| BulkFetchError::Sink(err.to_string()))?;
                item_count += 1;
            }
            match page.continuation_token {
                Some(token) if !token.is_empty() => job.continuation_token = Some(token),
                _ => {
                    job.continuation_token = None;
                    return Ok(item_count);
                }
            }
        }
    }
}
