// GB28181 网关配置
// 所有字段都有默认值，配置文件中可以只写需要覆盖的部分

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Udp,
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Udp => "UDP",
            Network::Tcp => "TCP",
        }
    }

    /// 从 Via 头的传输字段解析（`SIP/2.0/UDP`、`SIP/2.0/TCP`）
    pub fn from_via(via: &str) -> Option<Self> {
        let proto = via.split_whitespace().next()?;
        let transport = proto.rsplit('/').next()?;
        if transport.eq_ignore_ascii_case("tcp") {
            Some(Network::Tcp)
        } else if transport.eq_ignore_ascii_case("udp") {
            Some(Network::Udp)
        } else {
            None
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 网关总配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub sip: SipConfig,
    pub auth: AuthConfig,
    pub media: MediaConfig,
    pub position: PositionConfig,
    /// 心跳周期（秒），目录同步节流与设备失活判定都以它为基准
    pub heartbeat_interval_secs: u64,
    /// 清理封禁计数的周期（秒）
    pub remove_ban_interval_secs: u64,
    /// 是否对在线但未推流的通道自动发起 INVITE
    pub auto_invite: bool,
    /// 自动 INVITE 的重试间隔（秒）
    pub invite_retry_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            sip: SipConfig::default(),
            auth: AuthConfig::default(),
            media: MediaConfig::default(),
            position: PositionConfig::default(),
            heartbeat_interval_secs: 60,
            remove_ban_interval_secs: 600,
            auto_invite: false,
            invite_retry_secs: 10,
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn remove_ban_interval(&self) -> Duration {
        Duration::from_secs(self.remove_ban_interval_secs)
    }

    pub fn invite_retry_interval(&self) -> Duration {
        Duration::from_secs(self.invite_retry_secs)
    }
}

/// SIP 信令配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipConfig {
    pub listen_addr: String,
    pub port: u16,
    pub network: Network,
    /// 写入 From/Via/Contact 头中的对外地址
    pub public_ip: String,
    /// 平台自身的 20 位国标编码
    pub sip_id: String,
    pub domain: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 5060,
            network: Network::Udp,
            public_ip: "127.0.0.1".to_string(),
            sip_id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
        }
    }
}

impl SipConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}

/// 注册鉴权配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub realm: String,
    /// 允许的最大失败次数，超过后拒绝注册直到下一次清理
    pub max_register_count: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            realm: "3402000000".to_string(),
            max_register_count: 3,
        }
    }
}

impl AuthConfig {
    /// 用户名和密码都为空时不做鉴权
    pub fn is_required(&self) -> bool {
        !(self.username.is_empty() && self.password.is_empty())
    }
}

/// 媒体接收配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    pub listen_addr: String,
    /// 端口范围无效时使用的单一媒体端口
    pub port: u16,
    pub port_min: u16,
    pub port_max: u16,
    pub network: Network,
    /// 每个 SSRC 消费者的队列深度
    pub consumer_buffer: usize,
    /// 设置后为每个消费者落盘原始 RTP 包
    pub capture_dir: Option<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 58200,
            port_min: 0,
            port_max: 0,
            network: Network::Udp,
            consumer_buffer: 1024,
            capture_dir: None,
        }
    }
}

/// 移动位置订阅配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PositionConfig {
    pub autosub: bool,
    pub interval_secs: u64,
    pub expires_secs: u64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            autosub: false,
            interval_secs: 6,
            expires_secs: 3600,
        }
    }
}

impl PositionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn expires(&self) -> Duration {
        Duration::from_secs(self.expires_secs)
    }
}
