// GB28181 SIP 服务器
// 接收循环：UDP 每个数据报一个任务，TCP 每个连接一个任务

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

use super::dispatcher::SipDispatcher;
use super::message::SipMessage;
use super::transport::{read_sip_frame, SipTransport};
use crate::config::Network;
use crate::error::Result;
use crate::net::accept_with_backoff;

/// UDP 接收缓冲区大小
const UDP_BUFFER_SIZE: usize = 65536;

/// 每个 TCP 连接的待写消息数
const TCP_WRITE_QUEUE: usize = 64;

pub struct SipServer {
    transport: Arc<SipTransport>,
    dispatcher: Arc<SipDispatcher>,
}

impl SipServer {
    pub fn new(transport: Arc<SipTransport>, dispatcher: Arc<SipDispatcher>) -> Self {
        Self {
            transport,
            dispatcher,
        }
    }

    /// 启动服务器，直到监听套接字出错才返回
    pub async fn start(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            target: "gb28181::sip",
            local = %self.transport.local_addr(),
            "GB28181 SIP server started"
        );

        if let Some(socket) = self.transport.udp_socket() {
            return self.run_udp(socket).await;
        }
        if let Some(listener) = self.transport.take_tcp_listener() {
            return self.run_tcp(listener).await;
        }

        tracing::warn!(target: "gb28181::sip", "SIP server already started");
        Ok(())
    }

    async fn run_udp(self: Arc<Self>, socket: Arc<UdpSocket>) -> Result<()> {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let (len, addr) = socket.recv_from(&mut buf).await.map_err(|e| {
                tracing::error!(target: "gb28181::sip", "Failed to receive UDP packet: {}", e);
                e
            })?;

            let data = Bytes::copy_from_slice(&buf[..len]);
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_packet(data, addr, Network::Udp).await;
            });
        }
    }

    async fn run_tcp(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = accept_with_backoff("sip", || listener.accept()).await;
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_tcp(stream, peer).await;
            });
        }
    }

    async fn serve_tcp(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!(target: "gb28181::sip", remote = %peer, "SIP TCP connection opened");

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(TCP_WRITE_QUEUE);
        self.transport.register_tcp_peer(peer, tx);

        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = write_half.write_all(&data).await {
                    tracing::debug!(target: "gb28181::sip", remote = %peer, "SIP TCP write failed: {}", e);
                    break;
                }
            }
        });

        let mut reader = BufReader::new(read_half);
        loop {
            match read_sip_frame(&mut reader).await {
                Ok(Some(frame)) => self.handle_packet(Bytes::from(frame), peer, Network::Tcp).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "gb28181::sip", remote = %peer, "SIP TCP read failed: {}", e);
                    break;
                }
            }
        }

        self.transport.unregister_tcp_peer(&peer);
        writer.abort();
        tracing::debug!(target: "gb28181::sip", remote = %peer, "SIP TCP connection closed");
    }

    /// 处理一条完整的 SIP 消息
    async fn handle_packet(&self, data: Bytes, addr: SocketAddr, network: Network) {
        if data.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let req = match SipMessage::parse(&data) {
            Ok(SipMessage::Request(req)) => req,
            Ok(SipMessage::Response(resp)) => {
                tracing::debug!(
                    target: "gb28181::sip",
                    remote = %addr,
                    status = resp.status_code,
                    cseq = resp.headers.get("CSeq").unwrap_or_default(),
                    "SIP response received"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", remote = %addr, "Failed to parse SIP message: {}", e);
                return;
            }
        };

        let Some(resp) = self.dispatcher.handle(&req, addr, network).await else {
            return;
        };

        if let Err(e) = self.transport.send(resp.to_bytes(), addr, network).await {
            tracing::error!(target: "gb28181::sip", remote = %addr, "Failed to send response: {}", e);
        } else {
            tracing::debug!(
                target: "gb28181::sip",
                remote = %addr,
                status = resp.status_code,
                "Sent SIP response"
            );
        }
    }
}
