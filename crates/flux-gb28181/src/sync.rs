// 目录同步
// 负责向设备下发目录/设备信息查询，并把设备回报的目录、状态、录像、位置写回通道表

use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{GatewayConfig, Network, PositionConfig};
use crate::device::{ChannelStatus, Device, DeviceBinding, Position, Record};
use crate::error::{Gb28181Error, Result};
use crate::sip::manscdp::CatalogItem;

/// 下发请求的目标设备
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub device_id: String,
    pub addr: SocketAddr,
    pub transport: Network,
}

impl DeviceTarget {
    pub fn new(device_id: impl Into<String>, binding: DeviceBinding) -> Self {
        Self {
            device_id: device_id.into(),
            addr: binding.addr,
            transport: binding.transport,
        }
    }

    pub async fn of(device: &Device) -> Self {
        Self::new(device.id(), device.binding().await)
    }
}

/// 平台向设备发起的请求
#[async_trait]
pub trait DeviceQuerier: Send + Sync {
    async fn query_catalog(&self, target: &DeviceTarget) -> Result<()>;

    async fn subscribe_catalog(&self, target: &DeviceTarget) -> Result<()>;

    async fn query_device_info(&self, target: &DeviceTarget) -> Result<()>;

    async fn subscribe_mobile_position(
        &self,
        target: &DeviceTarget,
        expires: Duration,
        interval: Duration,
    ) -> Result<()>;

    /// 对通道发起实时点播，默认不支持
    async fn invite(&self, target: &DeviceTarget, channel_id: &str) -> Result<()> {
        let _ = target;
        Err(Gb28181Error::Unsupported(format!("INVITE {}", channel_id)))
    }
}

/// 目录同步器
pub struct CatalogSynchronizer {
    querier: Arc<dyn DeviceQuerier>,
    heartbeat_interval: Duration,
    auto_invite: bool,
    invite_retry: Duration,
    position: PositionConfig,
}

impl CatalogSynchronizer {
    pub fn new(querier: Arc<dyn DeviceQuerier>, config: &GatewayConfig) -> Self {
        Self {
            querier,
            heartbeat_interval: config.heartbeat_interval(),
            auto_invite: config.auto_invite,
            invite_retry: config.invite_retry_interval(),
            position: config.position.clone(),
        }
    }

    /// 同步通道
    ///
    /// 距上次同步超过两个心跳周期时下发目录查询、目录订阅和设备信息查询。
    /// 三个请求互不依赖，任一失败不影响其余请求。被节流时返回 `Ok(false)`，
    /// 全部发出时返回 `Ok(true)`，否则返回第一个错误。
    pub async fn sync_channels(&self, device: &Device) -> Result<bool> {
        if !device.try_claim_sync(self.heartbeat_interval * 2).await {
            return Ok(false);
        }

        let target = DeviceTarget::of(device).await;
        tracing::info!(target: "gb28181::sip", device_id = %target.device_id, "Syncing catalog");

        let outcomes = [
            ("catalog query", self.querier.query_catalog(&target).await),
            ("catalog subscribe", self.querier.subscribe_catalog(&target).await),
            ("device info query", self.querier.query_device_info(&target).await),
        ];

        let mut result = Ok(true);
        for (request, outcome) in outcomes {
            if let Err(e) = outcome {
                tracing::warn!(
                    target: "gb28181::sip",
                    device_id = %target.device_id,
                    request,
                    "Sync request failed: {}",
                    e
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// 后台同步，不阻塞调用方（失败已在 `sync_channels` 中逐条记录）
    pub fn spawn_sync(self: &Arc<Self>, device: Arc<Device>) {
        let sync = self.clone();
        tokio::spawn(async move {
            let _ = sync.sync_channels(&device).await;
        });
    }

    /// 目录应答：按 ID 插入或更新通道，返回处理的条目数
    pub async fn apply_catalog(&self, device: &Device, items: &[CatalogItem]) -> usize {
        let parent_id = device.id().to_string();
        let count = device
            .with_channels(|channels| {
                let mut count = 0;
                for item in items.iter().filter(|i| !i.device_id.is_empty()) {
                    channels.entry(&item.device_id, &parent_id).update_from(item);
                    count += 1;
                }
                count
            })
            .await;

        tracing::debug!(target: "gb28181::sip", device_id = %parent_id, count, "Catalog applied");
        count
    }

    /// 目录变更通知：按事件修改通道，返回受影响的通道数
    pub async fn apply_channel_status(&self, device: &Device, items: &[CatalogItem]) -> usize {
        let parent_id = device.id().to_string();
        device
            .with_channels(|channels| {
                let mut affected = 0;
                for item in items {
                    let event = if item.event.is_empty() {
                        item.status.as_str()
                    } else {
                        item.event.as_str()
                    };

                    match event.trim().to_ascii_uppercase().as_str() {
                        "ADD" | "UPDATE" => {
                            channels.entry(&item.device_id, &parent_id).update_from(item);
                            affected += 1;
                        }
                        "DEL" => {
                            if channels.remove(&item.device_id).is_some() {
                                affected += 1;
                            }
                        }
                        other => {
                            let status = ChannelStatus::parse(other);
                            if status == ChannelStatus::Unknown {
                                tracing::debug!(
                                    target: "gb28181::sip",
                                    channel_id = %item.device_id,
                                    event = other,
                                    "Unrecognized catalog event ignored"
                                );
                                continue;
                            }
                            let Some(channel) = channels.get_mut(&item.device_id) else {
                                tracing::debug!(
                                    target: "gb28181::sip",
                                    channel_id = %item.device_id,
                                    "Status notify for unknown channel"
                                );
                                continue;
                            };
                            channel.set_status(status);
                            affected += 1;
                        }
                    }
                }
                affected
            })
            .await
    }

    /// 录像查询应答：替换通道的录像列表
    pub async fn apply_records(&self, device: &Device, channel_id: &str, records: Vec<Record>) -> bool {
        device
            .with_channels(|channels| match channels.get_mut(channel_id) {
                Some(channel) => {
                    channel.records = records;
                    true
                }
                None => false,
            })
            .await
    }

    /// 移动位置通知：只更新位置，通道状态不变
    pub async fn apply_position(
        &self,
        device: &Device,
        channel_id: &str,
        time: &str,
        longitude: f64,
        latitude: f64,
    ) -> bool {
        let applied = device
            .with_channels(|channels| match channels.get_mut(channel_id) {
                Some(channel) => {
                    channel.position = Some(Position {
                        longitude,
                        latitude,
                        time: time.to_string(),
                        updated_at: Utc::now(),
                    });
                    true
                }
                None => false,
            })
            .await;

        device.stamp_gps().await;
        applied
    }

    pub async fn apply_device_info(&self, device: &Device, name: &str, manufacturer: &str, model: &str) {
        device.apply_info(name, manufacturer, model).await;
    }

    /// 对在线但未推流的通道发起点播，返回发起的数量
    pub async fn auto_invite(&self, device: &Device) -> usize {
        if !self.auto_invite {
            return 0;
        }

        let now = Utc::now();
        let retry = self.invite_retry;
        let due: Vec<String> = device
            .with_channels(|channels| {
                let ids: Vec<String> = channels
                    .iter()
                    .filter(|c| c.status == ChannelStatus::On && c.auto_invite.is_due(now, retry))
                    .map(|c| c.channel_id.clone())
                    .collect();
                for id in &ids {
                    if let Some(channel) = channels.get_mut(id) {
                        channel.auto_invite.last_attempt = Some(now);
                    }
                }
                ids
            })
            .await;

        if due.is_empty() {
            return 0;
        }

        let target = DeviceTarget::of(device).await;
        for channel_id in &due {
            let result = self.querier.invite(&target, channel_id).await;
            device
                .with_channels(|channels| {
                    if let Some(channel) = channels.get_mut(channel_id) {
                        match &result {
                            Ok(()) => {
                                channel.auto_invite.streaming = true;
                                channel.auto_invite.failures = 0;
                            }
                            Err(_) => channel.auto_invite.failures += 1,
                        }
                    }
                })
                .await;

            if let Err(e) = result {
                tracing::warn!(
                    target: "gb28181::sip",
                    device_id = %target.device_id,
                    %channel_id,
                    "Auto invite failed: {}",
                    e
                );
            }
        }

        due.len()
    }

    pub fn spawn_auto_invite(self: &Arc<Self>, device: Arc<Device>) {
        if !self.auto_invite {
            return;
        }
        let sync = self.clone();
        tokio::spawn(async move {
            sync.auto_invite(&device).await;
        });
    }

    /// 位置信息过期时重新订阅移动位置
    pub async fn subscribe_position_if_stale(&self, device: &Device) -> Result<bool> {
        if !self.position.autosub {
            return Ok(false);
        }
        if !device.position_stale(self.position.interval() * 2).await {
            return Ok(false);
        }

        let target = DeviceTarget::of(device).await;
        self.querier
            .subscribe_mobile_position(&target, self.position.expires(), self.position.interval())
            .await?;
        Ok(true)
    }

    pub fn spawn_position_subscribe(self: &Arc<Self>, device: Arc<Device>) {
        if !self.position.autosub {
            return;
        }
        let sync = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.subscribe_position_if_stale(&device).await {
                tracing::warn!(
                    target: "gb28181::sip",
                    device_id = %device.id(),
                    "Mobile position subscribe failed: {}",
                    e
                );
            }
        });
    }
}
