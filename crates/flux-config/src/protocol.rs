use serde::Deserialize;

/// 协议配置（泛型，支持不同协议的服务器配置）
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig<T> {
    pub server: T,
}
