// flux-gb28181: GB28181 设备网关核心库
//
// - 信令面：REGISTER 摘要鉴权与防暴力破解、心跳/目录/报警/位置处理
// - 媒体面：RTP/PS over TCP/UDP 接收，按 SSRC 分发给下游消费者
// - 端口池：按会话分配媒体端口

pub mod auth;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod media;
mod net;
pub mod port;
pub mod registry;
pub mod sip;
pub mod sync;

// 重新导出常用类型
pub use config::{GatewayConfig, Network};
pub use context::{Gateway, GatewayContext};
pub use device::{Channel, ChannelStatus, Device, DeviceStatus};
pub use error::{Gb28181Error, Result};
pub use media::{ConsumerHandle, ConsumerRegistry, ConsumerStream, RtpPacket};
pub use registry::DeviceRegistry;
pub use sync::{CatalogSynchronizer, DeviceQuerier, DeviceTarget};
