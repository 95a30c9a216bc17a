// 原始媒体包落盘
// 每条记录：4 字节包长（大端）+ 2 字节距上一包的毫秒数（大端）+ 原始 RTP 字节

use bytes::{BufMut, Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Gb28181Error, Result};

/// 写盘队列深度，写不过来时丢弃记录
const CAPTURE_QUEUE: usize = 1024;

/// 记录头长度
pub const RECORD_HEADER_LEN: usize = 6;

pub struct CaptureSink {
    tx: mpsc::Sender<Bytes>,
    last: Mutex<Option<Instant>>,
    writer: JoinHandle<std::io::Result<()>>,
}

impl CaptureSink {
    /// 启动写盘任务（需要在 tokio 运行时内调用）
    ///
    /// 目录和文件在写盘任务中创建，调用方不会阻塞在文件 I/O 上；
    /// 打开失败会记录日志，并由 `close` 返回。
    pub fn create(path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE);
        let writer = tokio::spawn(write_loop(path.into(), rx));

        Self {
            tx,
            last: Mutex::new(None),
            writer,
        }
    }

    /// 追加一条记录，队列满时返回 false
    pub fn record(&self, data: &[u8]) -> bool {
        let delta_ms = {
            let now = Instant::now();
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let delta = last.map(|prev| now.duration_since(prev).as_millis()).unwrap_or(0);
            *last = Some(now);
            u16::try_from(delta).unwrap_or(u16::MAX)
        };

        self.tx.try_send(encode_record(data, delta_ms)).is_ok()
    }

    /// 停止接收记录，等待写盘完成
    pub async fn close(self) -> Result<()> {
        drop(self.tx);
        self.writer
            .await
            .map_err(|e| Gb28181Error::Other(format!("capture writer panicked: {}", e)))??;
        Ok(())
    }
}

pub fn encode_record(data: &[u8], delta_ms: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + data.len());
    buf.put_u32(data.len() as u32);
    buf.put_u16(delta_ms);
    buf.put_slice(data);
    buf.freeze()
}

async fn open(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    Ok(BufWriter::new(File::create(path).await?))
}

async fn write_loop(path: PathBuf, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    let mut writer = match open(&path).await {
        Ok(writer) => writer,
        Err(e) => {
            tracing::warn!(target: "gb28181::media", path = %path.display(), "Failed to open capture file: {}", e);
            return Err(e);
        }
    };
    tracing::info!(target: "gb28181::media", path = %path.display(), "Capture started");

    while let Some(record) = rx.recv().await {
        if let Err(e) = writer.write_all(&record).await {
            tracing::warn!(target: "gb28181::media", path = %path.display(), "Capture write failed: {}", e);
            return Err(e);
        }
    }
    writer.flush().await
}
