// SSRC 消费者注册表
// 媒体面按 SSRC 找到下游消费者，非阻塞投递；消费者出错后不再接收数据

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::capture::CaptureSink;
use super::rtp::RtpPacket;
use crate::error::{Gb28181Error, Result};

struct ConsumerInner {
    ssrc: u32,
    tx: mpsc::Sender<RtpPacket>,
    error: OnceLock<String>,
    capture: Option<CaptureSink>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// 媒体面持有的消费者句柄
#[derive(Clone)]
pub struct ConsumerHandle {
    inner: Arc<ConsumerInner>,
}

impl ConsumerHandle {
    pub fn ssrc(&self) -> u32 {
        self.inner.ssrc
    }

    /// 非阻塞投递
    ///
    /// 队列满时丢包并返回 `QueueFull`；接收端已关闭时记录终止错误。
    pub fn push(&self, packet: RtpPacket) -> Result<()> {
        if let Some(reason) = self.inner.error.get() {
            return Err(Gb28181Error::ConsumerFailed(reason.clone()));
        }

        match self.inner.tx.try_send(packet) {
            Ok(()) => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Gb28181Error::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.fail("consumer receiver closed");
                Err(Gb28181Error::ConsumerClosed(self.inner.ssrc))
            }
        }
    }

    /// 镜像原始包到落盘文件（未开启时忽略）
    pub fn capture(&self, raw: &Bytes) {
        if let Some(sink) = &self.inner.capture {
            if !sink.record(raw) {
                tracing::trace!(target: "gb28181::media", ssrc = self.inner.ssrc, "Capture queue full");
            }
        }
    }

    /// 设置终止错误，只有第一次生效
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.inner.error.set(reason).is_ok() {
            tracing::info!(
                target: "gb28181::media",
                ssrc = self.inner.ssrc,
                reason = self.inner.error.get().map(String::as_str).unwrap_or_default(),
                "Consumer terminated"
            );
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.inner.error.get().map(String::as_str)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.error.get().is_some()
    }

    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// 下游持有的接收端
pub struct ConsumerStream {
    rx: mpsc::Receiver<RtpPacket>,
    handle: ConsumerHandle,
}

impl ConsumerStream {
    pub fn ssrc(&self) -> u32 {
        self.handle.ssrc()
    }

    pub async fn recv(&mut self) -> Option<RtpPacket> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RtpPacket> {
        self.rx.try_recv().ok()
    }

    /// 下游处理失败，通知媒体面停止投递
    pub fn fail(&self, reason: impl Into<String>) {
        self.handle.fail(reason);
    }

    pub fn handle(&self) -> &ConsumerHandle {
        &self.handle
    }
}

pub struct ConsumerRegistry {
    consumers: DashMap<u32, ConsumerHandle>,
    buffer: usize,
    capture_dir: Option<PathBuf>,
}

impl ConsumerRegistry {
    pub fn new(buffer: usize, capture_dir: Option<PathBuf>) -> Self {
        Self {
            consumers: DashMap::new(),
            buffer: buffer.max(1),
            capture_dir,
        }
    }

    /// 为 SSRC 注册消费者，已有存活消费者时返回 `ConsumerExists`
    ///
    /// 开启落盘时需要在 tokio 运行时内调用。
    pub fn register_consumer(&self, ssrc: u32) -> Result<(ConsumerHandle, ConsumerStream)> {
        let entry = self.consumers.entry(ssrc);
        if let Entry::Occupied(existing) = &entry {
            if !existing.get().is_terminated() {
                return Err(Gb28181Error::ConsumerExists(ssrc));
            }
        }

        // 落盘文件在写盘任务里打开，这里不做阻塞 I/O
        let capture = self
            .capture_dir
            .as_ref()
            .map(|dir| CaptureSink::create(dir.join(format!("{}.dump", ssrc))));

        let (tx, rx) = mpsc::channel(self.buffer);
        let handle = ConsumerHandle {
            inner: Arc::new(ConsumerInner {
                ssrc,
                tx,
                error: OnceLock::new(),
                capture,
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        };
        entry.insert(handle.clone());

        tracing::info!(target: "gb28181::media", ssrc, "Consumer registered");
        Ok((handle.clone(), ConsumerStream { rx, handle }))
    }

    pub fn unregister(&self, ssrc: u32) -> Option<ConsumerHandle> {
        let removed = self.consumers.remove(&ssrc).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::info!(target: "gb28181::media", ssrc, "Consumer unregistered");
        }
        removed
    }

    /// 查找存活的消费者，已终止的会被移除
    pub fn get(&self, ssrc: u32) -> Option<ConsumerHandle> {
        let handle = self.consumers.get(&ssrc).map(|h| h.clone())?;
        if handle.is_terminated() {
            self.consumers.remove_if(&ssrc, |_, h| h.is_terminated());
            return None;
        }
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ssrc: u32, seq: u16) -> RtpPacket {
        let mut data = vec![0x80, 0x60];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&ssrc.to_be_bytes());
        data.extend_from_slice(b"ps");
        RtpPacket::parse(Bytes::from(data)).unwrap()
    }

    #[tokio::test]
    async fn test_push_and_receive() {
        let registry = ConsumerRegistry::new(8, None);
        let (handle, mut stream) = registry.register_consumer(7).unwrap();

        handle.push(packet(7, 1)).unwrap();
        let received = stream.recv().await.unwrap();
        assert_eq!(received.sequence(), 1);
        assert_eq!(handle.delivered(), 1);
    }

    #[test]
    fn test_duplicate_live_consumer_rejected() {
        let registry = ConsumerRegistry::new(8, None);
        let (_handle, _stream) = registry.register_consumer(7).unwrap();
        assert!(matches!(
            registry.register_consumer(7),
            Err(Gb28181Error::ConsumerExists(7))
        ));
    }

    #[test]
    fn test_full_queue_drops() {
        let registry = ConsumerRegistry::new(1, None);
        let (handle, _stream) = registry.register_consumer(7).unwrap();

        handle.push(packet(7, 1)).unwrap();
        assert!(matches!(handle.push(packet(7, 2)), Err(Gb28181Error::QueueFull)));
        assert_eq!(handle.dropped(), 1);
        // 丢包不是终止错误
        assert!(!handle.is_terminated());
    }

    #[test]
    fn test_closed_receiver_terminates() {
        let registry = ConsumerRegistry::new(8, None);
        let (handle, stream) = registry.register_consumer(7).unwrap();
        drop(stream);

        assert!(matches!(
            handle.push(packet(7, 1)),
            Err(Gb28181Error::ConsumerClosed(7))
        ));
        assert!(handle.is_terminated());
        assert!(registry.get(7).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_fail_is_one_way() {
        let registry = ConsumerRegistry::new(8, None);
        let (handle, stream) = registry.register_consumer(7).unwrap();

        stream.fail("decoder error");
        handle.fail("second reason");
        assert_eq!(handle.error(), Some("decoder error"));
        assert!(matches!(
            handle.push(packet(7, 1)),
            Err(Gb28181Error::ConsumerFailed(_))
        ));

        // 终止后可以为同一 SSRC 重新注册
        assert!(registry.get(7).is_none());
        let (fresh, _stream) = registry.register_consumer(7).unwrap();
        assert!(!fresh.is_terminated());
    }

    #[tokio::test]
    async fn test_capture_file_per_ssrc() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConsumerRegistry::new(8, Some(dir.path().join("dumps")));
        let (handle, stream) = registry.register_consumer(7).unwrap();

        let raw = Bytes::from_static(&[0x80, 0x60, 0, 1, 0, 0, 0, 0, 0, 0, 0, 7]);
        handle.capture(&raw);
        registry.unregister(7);
        drop(handle);
        drop(stream);

        let path = dir.path().join("dumps").join("7.dump");
        let expected = crate::media::capture::RECORD_HEADER_LEN + raw.len();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if std::fs::metadata(&path).ok().map(|m| m.len() as usize) == Some(expected) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_unregister() {
        let registry = ConsumerRegistry::new(8, None);
        let (_handle, _stream) = registry.register_consumer(7).unwrap();
        assert!(registry.unregister(7).is_some());
        assert!(registry.unregister(7).is_none());
        assert!(registry.get(7).is_none());
    }
}
