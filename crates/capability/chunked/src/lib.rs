//! 分块调用与分页批量拉取。
//!
//! - `ChunkedCallClient`：压缩提交 → 202 受理 → 轮询 102 → 200 解压结果
//! - `BulkFetch`：启动拉取任务后按续传令牌逐页写入 `ItemSink`
//! - `JsonArrayWriter`：跨页保持合法 JSON 数组
//! - `ArtifactTransfer`：结果文件交给外部传输，不等待完成

mod bulk;
mod client;
mod codec;
mod error;
mod sink;
mod transfer;

pub use bulk::{
    BulkFetch, BulkFetchJob, BulkFetchSummary, DEFAULT_PAGE_METHOD, DEFAULT_START_METHOD,
};
pub use client::{ChunkedCallClient, ChunkedCallState};
pub use codec::{compress_json, decompress_json};
pub use error::{BulkFetchError, ChunkedCallError};
pub use sink::{ItemSink, JsonArrayWriter};
pub use transfer::{ArtifactTransfer, NoopTransfer, TransferError, hand_off};
