// 媒体接收与按 SSRC 分发
// TCP 与 UDP 只在取帧方式上不同，分发逻辑共用 PacketRouter + pump

use async_trait::async_trait;
use bytes::Bytes;
use flux_logging::{LogSampler, SamplingStrategy};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;

use super::consumer::ConsumerRegistry;
use super::rtp::RtpPacket;
use crate::error::{Gb28181Error, Result};

/// UDP 接收缓冲区大小（1 MiB，循环复用）
pub const UDP_BUFFER_SIZE: usize = 1 << 20;

/// 丢包日志的最小间隔
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// 一帧一个 RTP 包的来源
#[async_trait]
pub trait FrameSource: Send {
    /// 读取下一帧，任何错误都表示该来源结束
    async fn next_frame(&mut self) -> Result<Bytes>;

    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

/// RTP over TCP（RFC 4571）：2 字节大端长度 + 包体
pub struct TcpFrameSource<R> {
    reader: R,
    peer: Option<SocketAddr>,
}

impl<R> TcpFrameSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, peer: Option<SocketAddr>) -> Self {
        Self { reader, peer }
    }
}

#[async_trait]
impl<R> FrameSource for TcpFrameSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Bytes> {
        let len = self.reader.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// RTP over UDP：一个数据报一个包
pub struct UdpFrameSource {
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
    last_peer: Option<SocketAddr>,
}

impl UdpFrameSource {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            buf: vec![0u8; UDP_BUFFER_SIZE],
            last_peer: None,
        }
    }
}

#[async_trait]
impl FrameSource for UdpFrameSource {
    async fn next_frame(&mut self) -> Result<Bytes> {
        let (len, addr) = self.socket.recv_from(&mut self.buf).await?;
        self.last_peer = Some(addr);
        Ok(Bytes::copy_from_slice(&self.buf[..len]))
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.last_peer
    }
}

/// 单个包的分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// 没有对应的存活消费者
    UnknownSsrc,
    Malformed,
    /// 消费者队列满或已终止
    Dropped,
}

pub struct PacketRouter {
    consumers: Arc<ConsumerRegistry>,
    miss_log: LogSampler,
    malformed_log: LogSampler,
}

impl PacketRouter {
    pub fn new(consumers: Arc<ConsumerRegistry>) -> Self {
        Self::with_sampling(consumers, SamplingStrategy::Interval(DROP_LOG_INTERVAL))
    }

    pub fn with_sampling(consumers: Arc<ConsumerRegistry>, strategy: SamplingStrategy) -> Self {
        Self {
            consumers,
            miss_log: LogSampler::new(strategy.clone()),
            malformed_log: LogSampler::new(strategy),
        }
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    /// 解析一帧并投递给对应 SSRC 的消费者
    pub fn route(&self, frame: Bytes) -> RouteOutcome {
        let raw = frame.clone();
        let packet = match RtpPacket::parse(frame) {
            Ok(packet) => packet,
            Err(e) => {
                if self.malformed_log.should_sample() {
                    tracing::warn!(
                        target: "gb28181::media",
                        len = raw.len(),
                        suppressed = self.malformed_log.take_suppressed(),
                        "Discarding malformed RTP packet: {}",
                        e
                    );
                }
                return RouteOutcome::Malformed;
            }
        };

        let ssrc = packet.ssrc();
        let Some(consumer) = self.consumers.get(ssrc) else {
            if self.miss_log.should_sample() {
                tracing::warn!(
                    target: "gb28181::media",
                    ssrc,
                    suppressed = self.miss_log.take_suppressed(),
                    "No consumer for SSRC, dropping packet"
                );
            }
            return RouteOutcome::UnknownSsrc;
        };

        consumer.capture(&raw);
        match consumer.push(packet) {
            Ok(()) => RouteOutcome::Delivered,
            Err(Gb28181Error::QueueFull) => {
                tracing::trace!(target: "gb28181::media", ssrc, "Consumer queue full, packet dropped");
                RouteOutcome::Dropped
            }
            Err(e) => {
                tracing::debug!(target: "gb28181::media", ssrc, "Consumer rejected packet: {}", e);
                RouteOutcome::Dropped
            }
        }
    }
}

/// 从来源持续取帧并分发，来源结束时返回
///
/// 对端正常关闭（EOF）返回 `Ok`，其他读错误原样返回。
pub async fn pump<S>(source: &mut S, router: &PacketRouter) -> Result<u64>
where
    S: FrameSource + ?Sized,
{
    let mut delivered = 0u64;
    loop {
        let frame = match source.next_frame().await {
            Ok(frame) => frame,
            Err(Gb28181Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::debug!(
                    target: "gb28181::media",
                    remote = ?source.peer(),
                    delivered,
                    "Media source closed"
                );
                return Ok(delivered);
            }
            Err(e) => return Err(e),
        };

        if router.route(frame) == RouteOutcome::Delivered {
            delivered += 1;
        }
    }
}
