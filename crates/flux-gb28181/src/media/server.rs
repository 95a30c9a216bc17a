// 媒体端口监听
// 端口范围有效时按会话分配端口，否则在固定端口上接收所有流

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};

use super::consumer::ConsumerRegistry;
use super::ingest::{pump, PacketRouter, TcpFrameSource, UdpFrameSource};
use crate::config::{MediaConfig, Network};
use crate::error::{Gb28181Error, Result};
use crate::net::accept_with_backoff;
use crate::port::PortManager;

/// 一个正在运行的媒体监听
///
/// 关闭或丢弃时停止监听，并终止该监听接入的所有连接。
pub struct MediaListener {
    local_addr: SocketAddr,
    network: Network,
    task: JoinHandle<Result<()>>,
}

impl MediaListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn close(&self) {
        self.task.abort();
    }

    /// 等待监听结束，被 `close` 取消时返回 `Ok`
    pub async fn wait(&mut self) -> Result<()> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Gb28181Error::Other(format!("media listener panicked: {}", e))),
        }
    }
}

impl Drop for MediaListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// 按会话分配端口的监听，关闭或丢弃时归还端口
pub struct SessionListener {
    port: u16,
    listener: MediaListener,
    ports: Arc<PortManager>,
}

impl SessionListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.listener.close();
        self.ports.release(self.port);
        tracing::debug!(target: "gb28181::media", port = self.port, "Media session closed");
    }
}

pub struct MediaServer {
    config: MediaConfig,
    router: Arc<PacketRouter>,
    ports: Arc<PortManager>,
}

impl MediaServer {
    pub fn new(config: MediaConfig, consumers: Arc<ConsumerRegistry>) -> Self {
        Self {
            config,
            router: Arc::new(PacketRouter::new(consumers)),
            ports: Arc::new(PortManager::new()),
        }
    }

    pub fn router(&self) -> &Arc<PacketRouter> {
        &self.router
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    /// 初始化端口池；范围无效时在固定媒体端口上监听
    ///
    /// 返回固定端口的监听，使用端口池时返回 `None`。
    pub async fn start(&self) -> Result<Option<MediaListener>> {
        self.ports.init(self.config.port_min, self.config.port_max);

        if self.ports.is_valid() {
            tracing::info!(
                target: "gb28181::media",
                network = %self.config.network,
                min = self.config.port_min,
                max = self.config.port_max,
                "Media port range enabled"
            );
            return Ok(None);
        }

        let listener = self.listen(self.config.port).await?;
        Ok(Some(listener))
    }

    /// 从端口池分配端口并开始监听
    pub async fn open_session(&self) -> Result<SessionListener> {
        if !self.ports.is_valid() {
            return Err(Gb28181Error::Unsupported(
                "media port range is not configured".to_string(),
            ));
        }
        let port = self.ports.allocate().ok_or(Gb28181Error::PortExhausted)?;

        match self.listen(port).await {
            Ok(listener) => Ok(SessionListener {
                port,
                listener,
                ports: self.ports.clone(),
            }),
            Err(e) => {
                self.ports.release(port);
                Err(e)
            }
        }
    }

    /// 按配置的传输层在指定端口监听
    pub async fn listen(&self, port: u16) -> Result<MediaListener> {
        let addr = format!("{}:{}", self.config.listen_addr, port);
        match self.config.network {
            Network::Tcp => self.listen_tcp(&addr).await,
            Network::Udp => self.listen_udp(&addr).await,
        }
    }

    async fn listen_tcp(&self, addr: &str) -> Result<MediaListener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(target: "gb28181::media", local = %local_addr, "Media TCP listener started");

        let task = tokio::spawn(serve_tcp(listener, self.router.clone()));

        Ok(MediaListener {
            local_addr,
            network: Network::Tcp,
            task,
        })
    }

    async fn listen_udp(&self, addr: &str) -> Result<MediaListener> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        tracing::info!(target: "gb28181::media", local = %local_addr, "Media UDP listener started");

        let router = self.router.clone();
        let task = tokio::spawn(async move {
            let mut source = UdpFrameSource::new(socket);
            pump(&mut source, &router).await.map(|_| ()).map_err(|e| {
                tracing::error!(target: "gb28181::media", local = %local_addr, "Media UDP receive failed: {}", e);
                e
            })
        });

        Ok(MediaListener {
            local_addr,
            network: Network::Udp,
            task,
        })
    }
}

/// TCP 媒体监听循环
///
/// 连接任务归监听所有，监听任务被取消时一并终止。
async fn serve_tcp(listener: TcpListener, router: Arc<PacketRouter>) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            (stream, peer) = accept_with_backoff("media", || listener.accept()) => {
                let router = router.clone();
                connections.spawn(async move {
                    tracing::debug!(target: "gb28181::media", remote = %peer, "Media TCP connection opened");
                    let mut source = TcpFrameSource::new(BufReader::new(stream), Some(peer));
                    if let Err(e) = pump(&mut source, &router).await {
                        tracing::debug!(target: "gb28181::media", remote = %peer, "Media TCP connection closed: {}", e);
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}
