// SIP 传输层
// UDP 单套接字收发；TCP 每个连接一个写队列，按对端地址索引，下发请求与应答共用

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

use super::message::Headers;
use crate::config::{Network, SipConfig};
use crate::error::{Gb28181Error, Result};

/// 单条 SIP 消息头部上限
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// 单条 SIP 消息体上限
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct SipTransport {
    network: Network,
    local_addr: SocketAddr,
    udp: Option<Arc<UdpSocket>>,
    tcp_listener: Mutex<Option<TcpListener>>,
    tcp_peers: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
}

impl SipTransport {
    /// 按配置绑定 UDP 或 TCP 监听
    pub async fn bind(config: &SipConfig) -> Result<Arc<Self>> {
        let bind_addr = config.bind_addr();
        let transport = match config.network {
            Network::Udp => {
                let socket = UdpSocket::bind(&bind_addr).await?;
                Self {
                    network: Network::Udp,
                    local_addr: socket.local_addr()?,
                    udp: Some(Arc::new(socket)),
                    tcp_listener: Mutex::new(None),
                    tcp_peers: DashMap::new(),
                }
            }
            Network::Tcp => {
                let listener = TcpListener::bind(&bind_addr).await?;
                Self {
                    network: Network::Tcp,
                    local_addr: listener.local_addr()?,
                    udp: None,
                    tcp_listener: Mutex::new(Some(listener)),
                    tcp_peers: DashMap::new(),
                }
            }
        };

        tracing::info!(
            target: "gb28181::sip",
            local = %transport.local_addr,
            network = %transport.network,
            "GB28181 SIP transport bound"
        );
        Ok(Arc::new(transport))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn udp_socket(&self) -> Option<Arc<UdpSocket>> {
        self.udp.clone()
    }

    /// 取走 TCP 监听器（只能取一次）
    pub(crate) fn take_tcp_listener(&self) -> Option<TcpListener> {
        self.tcp_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn register_tcp_peer(&self, peer: SocketAddr, writer: mpsc::Sender<Bytes>) {
        self.tcp_peers.insert(peer, writer);
    }

    pub(crate) fn unregister_tcp_peer(&self, peer: &SocketAddr) {
        self.tcp_peers.remove(peer);
    }

    /// 发送一条完整的 SIP 消息
    pub async fn send(&self, data: Bytes, addr: SocketAddr, network: Network) -> Result<()> {
        match network {
            Network::Udp => {
                let socket = self.udp.as_ref().ok_or_else(|| {
                    Gb28181Error::TransportUnavailable("UDP signaling is not enabled".to_string())
                })?;
                socket.send_to(&data, addr).await?;
            }
            Network::Tcp => {
                let writer = self
                    .tcp_peers
                    .get(&addr)
                    .map(|w| w.clone())
                    .ok_or_else(|| {
                        Gb28181Error::TransportUnavailable(format!("no TCP connection to {}", addr))
                    })?;
                writer
                    .send(data)
                    .await
                    .map_err(|_| Gb28181Error::TransportUnavailable(format!("TCP connection to {} closed", addr)))?;
            }
        }
        Ok(())
    }
}

/// 从 TCP 流中读出一条 SIP 消息（头部 + Content-Length 指定的消息体）
///
/// 连接在消息边界处正常关闭时返回 `Ok(None)`。消息之间的空行（CRLF 保活）被跳过。
pub async fn read_sip_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        // 单行读取也受头部上限约束
        let limit = (MAX_HEADER_BYTES + 1 - frame.len()) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
        if n == 0 {
            if frame.is_empty() {
                return Ok(None);
            }
            return Err(Gb28181Error::SipParse("connection closed mid-message".to_string()));
        }

        let blank = line == b"\r\n" || line == b"\n";
        if blank && frame.is_empty() {
            continue;
        }

        frame.extend_from_slice(&line);
        if blank {
            break;
        }
        if frame.len() > MAX_HEADER_BYTES {
            return Err(Gb28181Error::SipParse("SIP header too large".to_string()));
        }
    }

    let head = String::from_utf8_lossy(&frame);
    let headers = Headers::parse_head(&head);
    let content_length = headers.content_length().unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(Gb28181Error::SipParse(format!(
            "SIP body too large: {} bytes",
            content_length
        )));
    }

    let start = frame.len();
    frame.resize(start + content_length, 0);
    reader.read_exact(&mut frame[start..]).await?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_read_frames_from_stream() {
        let data: &[u8] = b"\r\n\r\nMESSAGE sip:a@b SIP/2.0\r\nl: 5\r\n\r\nhelloBYE sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut reader = BufReader::new(data);

        let first = read_sip_frame(&mut reader).await.unwrap().unwrap();
        assert!(first.starts_with(b"MESSAGE"));
        assert!(first.ends_with(b"\r\n\r\nhello"));

        let second = read_sip_frame(&mut reader).await.unwrap().unwrap();
        assert!(second.starts_with(b"BYE"));

        assert!(read_sip_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let data: &[u8] = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 10\r\n\r\nabc";
        let mut reader = BufReader::new(data);
        assert!(read_sip_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_content_length_is_rejected() {
        let data: &[u8] = b"MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 99999999999\r\n\r\nabc";
        let mut reader = BufReader::new(data);
        assert!(matches!(
            read_sip_frame(&mut reader).await,
            Err(Gb28181Error::SipParse(_))
        ));
    }

    #[tokio::test]
    async fn test_unterminated_header_line_is_rejected() {
        let data = vec![b'a'; MAX_HEADER_BYTES + 16];
        let mut reader = BufReader::new(&data[..]);
        assert!(matches!(
            read_sip_frame(&mut reader).await,
            Err(Gb28181Error::SipParse(_))
        ));
    }

    #[tokio::test]
    async fn test_udp_send_requires_udp() {
        let config = SipConfig {
            listen_addr: "127.0.0.1".to_string(),
            port: 0,
            network: Network::Tcp,
            ..Default::default()
        };
        let transport = SipTransport::bind(&config).await.unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(transport.send(Bytes::from_static(b"x"), target, Network::Udp).await.is_err());
        assert!(transport.send(Bytes::from_static(b"x"), target, Network::Tcp).await.is_err());
        assert!(transport.take_tcp_listener().is_some());
        assert!(transport.take_tcp_listener().is_none());
    }
}
