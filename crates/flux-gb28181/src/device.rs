// GB28181 设备与通道
// 设备以 Arc 共享，描述性状态和通道表各自持有一把读写锁

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::Network;
use crate::sip::manscdp::{CatalogItem, RecordItem};

/// 设备状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    Offline,
    /// 已通过注册，等待第一条 MESSAGE
    Registering,
    /// 失联后重新出现，需要重新绑定地址并同步目录
    Recover,
    Online,
    Alarmed,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Offline => "OFFLINE",
            DeviceStatus::Registering => "REGISTER",
            DeviceStatus::Recover => "RECOVER",
            DeviceStatus::Online => "ONLINE",
            DeviceStatus::Alarmed => "ALARMED",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelStatus {
    On,
    Off,
    /// 视频丢失
    Vlost,
    /// 故障
    Defect,
    Unknown,
}

impl ChannelStatus {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "ONLINE" | "OK" => ChannelStatus::On,
            "OFF" | "OFFLINE" => ChannelStatus::Off,
            "VLOST" => ChannelStatus::Vlost,
            "DEFECT" => ChannelStatus::Defect,
            _ => ChannelStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::On => "ON",
            ChannelStatus::Off => "OFF",
            ChannelStatus::Vlost => "VLOST",
            ChannelStatus::Defect => "DEFECT",
            ChannelStatus::Unknown => "UNKNOWN",
        }
    }
}

/// 设备来源地址与传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBinding {
    pub addr: SocketAddr,
    pub transport: Network,
}

impl DeviceBinding {
    pub fn new(addr: SocketAddr, transport: Network) -> Self {
        Self { addr, transport }
    }
}

/// 位置信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
    /// 设备上报的时间（原样保存）
    pub time: String,
    pub updated_at: DateTime<Utc>,
}

/// 录像片段
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub device_id: String,
    pub name: String,
    pub file_path: String,
    pub address: String,
    pub start_time: String,
    pub end_time: String,
    pub secrecy: u8,
    pub record_type: String,
    pub recorder_id: String,
}

impl From<&RecordItem> for Record {
    fn from(item: &RecordItem) -> Self {
        Self {
            device_id: item.device_id.clone(),
            name: item.name.clone(),
            file_path: item.file_path.clone(),
            address: item.address.clone(),
            start_time: item.start_time.clone(),
            end_time: item.end_time.clone(),
            secrecy: item.secrecy.unwrap_or_default(),
            record_type: item.record_type.clone(),
            recorder_id: item.recorder_id.clone(),
        }
    }
}

/// 自动拉流状态
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoInviteState {
    pub streaming: bool,
    pub failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl AutoInviteState {
    /// 未在推流且距上次尝试已超过重试间隔
    pub fn is_due(&self, now: DateTime<Utc>, retry: Duration) -> bool {
        if self.streaming {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(at) => now - at >= to_chrono(retry),
        }
    }
}

/// 设备通道（摄像头）
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// 通道 ID（20位国标编码）
    pub channel_id: String,
    /// 父设备 ID
    pub parent_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub status: ChannelStatus,
    pub position: Option<Position>,
    pub records: Vec<Record>,
    pub auto_invite: AutoInviteState,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, parent_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            parent_id: parent_id.into(),
            name: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            status: ChannelStatus::Unknown,
            position: None,
            records: Vec::new(),
            auto_invite: AutoInviteState::default(),
        }
    }

    /// 用目录项覆盖描述字段，录像和拉流状态保持不变
    pub fn update_from(&mut self, item: &CatalogItem) {
        self.name = item.name.clone();
        self.manufacturer = item.manufacturer.clone();
        self.model = item.model.clone();
        self.set_status(ChannelStatus::parse(&item.status));
        if !item.parent_id.is_empty() {
            self.parent_id = item.parent_id.clone();
        }
        if let (Some(longitude), Some(latitude)) = (item.longitude, item.latitude) {
            self.position = Some(Position {
                longitude,
                latitude,
                time: String::new(),
                updated_at: Utc::now(),
            });
        }
    }

    pub fn set_status(&mut self, status: ChannelStatus) {
        if status != ChannelStatus::On {
            self.auto_invite.streaming = false;
        }
        self.status = status;
    }
}

/// 按到达顺序保存的通道表，ID 唯一
#[derive(Debug, Clone, Default)]
pub struct ChannelMap {
    order: Vec<String>,
    by_id: HashMap<String, Channel>,
}

impl ChannelMap {
    pub fn get(&self, channel_id: &str) -> Option<&Channel> {
        self.by_id.get(channel_id)
    }

    pub fn get_mut(&mut self, channel_id: &str) -> Option<&mut Channel> {
        self.by_id.get_mut(channel_id)
    }

    /// 插入或取出已有通道
    pub fn entry(&mut self, channel_id: &str, parent_id: &str) -> &mut Channel {
        if !self.by_id.contains_key(channel_id) {
            self.order.push(channel_id.to_string());
        }
        self.by_id
            .entry(channel_id.to_string())
            .or_insert_with(|| Channel::new(channel_id, parent_id))
    }

    pub fn remove(&mut self, channel_id: &str) -> Option<Channel> {
        let removed = self.by_id.remove(channel_id)?;
        self.order.retain(|id| id != channel_id);
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.order.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// 设备描述性状态的快照
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub status: DeviceStatus,
    pub binding: DeviceBinding,
    pub register_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_keepalive: Option<DateTime<Utc>>,
    pub last_gps: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// GB28181 设备
#[derive(Debug)]
pub struct Device {
    device_id: String,
    state: RwLock<DeviceState>,
    channels: RwLock<ChannelMap>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, binding: DeviceBinding) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            state: RwLock::new(DeviceState {
                name: String::new(),
                manufacturer: String::new(),
                model: String::new(),
                status: DeviceStatus::Registering,
                binding,
                register_time: now,
                updated_at: now,
                last_keepalive: None,
                last_gps: None,
                last_sync: None,
            }),
            channels: RwLock::new(ChannelMap::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.device_id
    }

    pub async fn snapshot(&self) -> DeviceState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> DeviceStatus {
        self.state.read().await.status
    }

    pub async fn set_status(&self, status: DeviceStatus) {
        self.state.write().await.status = status;
    }

    pub async fn binding(&self) -> DeviceBinding {
        self.state.read().await.binding
    }

    /// 重新绑定来源地址并回到注册中状态，通道表保留
    pub async fn recover(&self, binding: DeviceBinding) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.binding = binding;
        state.status = DeviceStatus::Registering;
        state.register_time = now;
        state.updated_at = now;
    }

    /// 刷新最后更新时间
    pub async fn touch(&self) {
        self.state.write().await.updated_at = Utc::now();
    }

    pub async fn stamp_keepalive(&self) {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.last_keepalive = Some(now);
        state.updated_at = now;
    }

    pub async fn stamp_gps(&self) {
        self.state.write().await.last_gps = Some(Utc::now());
    }

    /// 在线/报警设备超过 `timeout` 没有任何消息时标记为 RECOVER
    pub async fn mark_recover_if_stale(&self, timeout: Duration) -> bool {
        let mut state = self.state.write().await;
        let stale = Utc::now() - state.updated_at > to_chrono(timeout);
        if stale && matches!(state.status, DeviceStatus::Online | DeviceStatus::Alarmed) {
            state.status = DeviceStatus::Recover;
            return true;
        }
        false
    }

    /// 检查并占用一次目录同步
    ///
    /// 上次同步距今超过 `min_interval`（或从未同步）时写入当前时间并返回 true。
    /// 检查与写入在同一把写锁内完成，并发调用只有一个会成功。
    pub async fn try_claim_sync(&self, min_interval: Duration) -> bool {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let due = match state.last_sync {
            None => true,
            Some(at) => now - at > to_chrono(min_interval),
        };
        if due {
            state.last_sync = Some(now);
        }
        due
    }

    /// 位置信息从未上报或早于 `window`
    pub async fn position_stale(&self, window: Duration) -> bool {
        match self.state.read().await.last_gps {
            None => true,
            Some(at) => Utc::now() - at > to_chrono(window),
        }
    }

    pub async fn apply_info(&self, name: &str, manufacturer: &str, model: &str) {
        let mut state = self.state.write().await;
        state.name = name.to_string();
        state.manufacturer = manufacturer.to_string();
        state.model = model.to_string();
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// 按到达顺序返回全部通道
    pub async fn channels(&self) -> Vec<Channel> {
        self.channels.read().await.iter().cloned().collect()
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// 在通道表写锁内执行修改
    pub async fn with_channels<R>(&self, f: impl FnOnce(&mut ChannelMap) -> R) -> R {
        let mut channels = self.channels.write().await;
        f(&mut channels)
    }
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(port: u16) -> DeviceBinding {
        DeviceBinding::new(format!("192.168.1.64:{}", port).parse().unwrap(), Network::Udp)
    }

    fn item(id: &str, status: &str) -> CatalogItem {
        CatalogItem {
            device_id: id.to_string(),
            name: format!("cam-{}", id),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_device_is_registering() {
        let device = Device::new("34020000001320000001", binding(5060));
        assert_eq!(device.status().await, DeviceStatus::Registering);
        assert_eq!(device.status().await.as_str(), "REGISTER");
        assert_eq!(device.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_recover_keeps_channels() {
        let device = Device::new("34020000001320000001", binding(5060));
        let ch = item("34020000001310000001", "ON");
        device
            .with_channels(|map| map.entry(&ch.device_id, device.id()).update_from(&ch))
            .await;
        device.set_status(DeviceStatus::Online).await;

        device.recover(binding(5070)).await;

        let state = device.snapshot().await;
        assert_eq!(state.status, DeviceStatus::Registering);
        assert_eq!(state.binding.addr.port(), 5070);
        assert_eq!(device.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_sync_claim_throttles() {
        let device = Device::new("34020000001320000001", binding(5060));
        assert!(device.try_claim_sync(Duration::from_secs(120)).await);
        assert!(!device.try_claim_sync(Duration::from_secs(120)).await);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(device.try_claim_sync(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_stale_detection() {
        let device = Device::new("34020000001320000001", binding(5060));
        device.set_status(DeviceStatus::Online).await;

        assert!(!device.mark_recover_if_stale(Duration::from_secs(180)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(device.mark_recover_if_stale(Duration::from_millis(1)).await);
        assert_eq!(device.status().await, DeviceStatus::Recover);
    }

    #[test]
    fn test_channel_map_keeps_arrival_order() {
        let mut map = ChannelMap::default();
        for id in ["c", "a", "b"] {
            map.entry(id, "dev");
        }
        map.entry("a", "dev").name = "renamed".to_string();

        assert_eq!(map.ids().collect::<Vec<_>>(), vec!["c", "a", "b"]);
        assert_eq!(map.get("a").unwrap().name, "renamed");

        map.remove("a");
        assert_eq!(map.ids().collect::<Vec<_>>(), vec!["c", "b"]);
        assert_eq!(map.len(), 2);
    }

    fn assert_serialize<T: Serialize>() {}

    #[test]
    fn test_models_are_serializable() {
        assert_serialize::<DeviceStatus>();
        assert_serialize::<ChannelStatus>();
        assert_serialize::<Position>();
        assert_serialize::<Record>();
    }

    #[test]
    fn test_channel_status_parse() {
        assert_eq!(ChannelStatus::parse("ON"), ChannelStatus::On);
        assert_eq!(ChannelStatus::parse("online"), ChannelStatus::On);
        assert_eq!(ChannelStatus::parse("OFF"), ChannelStatus::Off);
        assert_eq!(ChannelStatus::parse("VLOST"), ChannelStatus::Vlost);
        assert_eq!(ChannelStatus::parse("DEFECT"), ChannelStatus::Defect);
        assert_eq!(ChannelStatus::parse(""), ChannelStatus::Unknown);
    }

    #[test]
    fn test_status_off_stops_streaming() {
        let mut channel = Channel::new("c", "d");
        channel.auto_invite.streaming = true;
        channel.set_status(ChannelStatus::Off);
        assert!(!channel.auto_invite.streaming);
    }

    #[test]
    fn test_auto_invite_due() {
        let now = Utc::now();
        let mut state = AutoInviteState::default();
        assert!(state.is_due(now, Duration::from_secs(10)));

        state.last_attempt = Some(now);
        assert!(!state.is_due(now, Duration::from_secs(10)));
        assert!(state.is_due(now + ChronoDuration::seconds(11), Duration::from_secs(10)));

        state.streaming = true;
        assert!(!state.is_due(now + ChronoDuration::seconds(60), Duration::from_secs(10)));
    }
}
