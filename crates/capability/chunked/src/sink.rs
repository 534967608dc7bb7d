use async_trait::async_trait;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// 批量结果的逐项写入端。
#[async_trait]
pub trait ItemSink: Send {
    async fn begin(&mut self) -> io::Result<()>;
    async fn write_item(&mut self, item: &Value) -> io::Result<()>;
    /// 结束写入；可重复调用。
    async fn finish(&mut self) -> io::Result<()>;
}

/// 以 `[`、逗号分隔、`]` 组织的 JSON 数组写入器，跨页保持合法格式。
pub struct JsonArrayWriter<W> {
    writer: W,
    items: usize,
    begun: bool,
    finished: bool,
}

impl<W> JsonArrayWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            items: 0,
            begun: false,
            finished: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ItemSink for JsonArrayWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn begin(&mut self) -> io::Result<()> {
        if !self.begun {
            self.writer.write_all(b"[").await?;
            self.begun = true;
        }
        Ok(())
    }

    async fn write_item(&mut self, item: &Value) -> io::Result<()> {
        self.begin().await?;
        let bytes = serde_json::to_vec(item)?;
        if self.items > 0 {
            self.writer.write_all(b",").await?;
        }
        self.writer.write_all(&bytes).await?;
        self.items += 1;
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.begin().await?;
        self.writer.write_all(b"]").await?;
        self.writer.flush().await?;
        self.finished = true;
        Ok(())
    }
}
