// 网关上下文与组装
// 注册表由上下文持有并注入各组件，不使用进程级全局变量

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::media::{ConsumerHandle, ConsumerRegistry, ConsumerStream, MediaServer};
use crate::registry::DeviceRegistry;
use crate::sip::{SipDispatcher, SipQuerier, SipServer, SipTransport};
use crate::sync::{CatalogSynchronizer, DeviceQuerier};

/// 进程内共享的网关状态
#[derive(Clone)]
pub struct GatewayContext {
    config: Arc<GatewayConfig>,
    devices: Arc<DeviceRegistry>,
    consumers: Arc<ConsumerRegistry>,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Self {
        let devices = Arc::new(DeviceRegistry::new(config.auth.max_register_count));
        let consumers = Arc::new(ConsumerRegistry::new(
            config.media.consumer_buffer,
            config.media.capture_dir.clone(),
        ));
        Self {
            config: Arc::new(config),
            devices,
            consumers,
        }
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn consumers(&self) -> &Arc<ConsumerRegistry> {
        &self.consumers
    }

    /// 下游为某个 SSRC 注册消费者
    pub fn register_consumer(&self, ssrc: u32) -> Result<(ConsumerHandle, ConsumerStream)> {
        self.consumers.register_consumer(ssrc)
    }
}

/// 组装好的网关：SIP 信令 + 媒体接收
pub struct Gateway {
    context: GatewayContext,
    transport: Arc<SipTransport>,
    sip: Arc<SipServer>,
    media: Arc<MediaServer>,
}

impl Gateway {
    /// 绑定 SIP 监听，使用内置的 SIP 下发实现
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        let context = GatewayContext::new(config);
        let transport = SipTransport::bind(&context.config.sip).await?;
        let querier = Arc::new(SipQuerier::new(transport.clone(), context.config.sip.clone()));
        Ok(Self::assemble(context, transport, querier))
    }

    /// 绑定 SIP 监听，使用外部提供的下发实现（例如支持 INVITE 的实现）
    pub async fn bind_with_querier(
        config: GatewayConfig,
        querier: Arc<dyn DeviceQuerier>,
    ) -> Result<Self> {
        let context = GatewayContext::new(config);
        let transport = SipTransport::bind(&context.config.sip).await?;
        Ok(Self::assemble(context, transport, querier))
    }

    fn assemble(
        context: GatewayContext,
        transport: Arc<SipTransport>,
        querier: Arc<dyn DeviceQuerier>,
    ) -> Self {
        let sync = Arc::new(CatalogSynchronizer::new(querier, &context.config));
        let dispatcher = Arc::new(SipDispatcher::new(
            context.config.clone(),
            context.devices.clone(),
            sync,
        ));
        let sip = Arc::new(SipServer::new(transport.clone(), dispatcher));
        let media = Arc::new(MediaServer::new(
            context.config.media.clone(),
            context.consumers.clone(),
        ));

        Self {
            context,
            transport,
            sip,
            media,
        }
    }

    pub fn context(&self) -> &GatewayContext {
        &self.context
    }

    pub fn sip_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn media(&self) -> &Arc<MediaServer> {
        &self.media
    }

    /// 运行网关，直到 SIP 或固定端口媒体监听退出
    pub async fn run(self) -> Result<()> {
        let config = self.context.config.clone();

        let sweeper = if config.auth.is_required() {
            Some(
                self.context
                    .devices
                    .spawn_ban_sweeper(config.remove_ban_interval()),
            )
        } else {
            None
        };

        let media = self.media.start().await?;
        let sip = self.sip.clone().start();

        let result = match media {
            Some(mut listener) => {
                let result = tokio::select! {
                    result = sip => result,
                    result = listener.wait() => result,
                };
                listener.close();
                result
            }
            None => sip.await,
        };

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        tracing::info!(target: "gb28181::sip", "GB28181 gateway stopped");
        result
    }
}
