// 设备注册表
// 设备、待完成的鉴权挑战、失败计数三张并发表，由 GatewayContext 持有

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::auth::generate_nonce;
use crate::device::{Channel, Device, DeviceBinding};

pub struct DeviceRegistry {
    devices: DashMap<String, Arc<Device>>,
    /// device_id -> nonce
    nonces: DashMap<String, String>,
    /// device_id -> 连续鉴权失败次数
    attempts: DashMap<String, u32>,
    max_attempts: u32,
}

impl DeviceRegistry {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            devices: DashMap::new(),
            nonces: DashMap::new(),
            attempts: DashMap::new(),
            max_attempts,
        }
    }

    /// 注册或恢复设备
    ///
    /// 新设备原子插入；已知设备重新绑定来源地址并回到注册中状态，通道表保留。
    /// 同一 ID 并发调用始终得到同一个实例。
    pub async fn register_or_recover(&self, device_id: &str, binding: DeviceBinding) -> Arc<Device> {
        let (device, inserted) = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let device = Arc::new(Device::new(device_id, binding));
                e.insert(device.clone());
                (device, true)
            }
        };

        // entry 守卫已释放，再去拿设备自身的锁
        if inserted {
            tracing::info!(
                target: "gb28181::sip",
                %device_id,
                remote = %binding.addr,
                transport = %binding.transport,
                "Device registered"
            );
        } else {
            device.recover(binding).await;
            tracing::info!(
                target: "gb28181::sip",
                %device_id,
                remote = %binding.addr,
                "Device re-registered"
            );
        }

        device
    }

    /// 发起鉴权挑战
    ///
    /// 已有未完成的挑战时返回原 nonce。
    pub fn challenge(&self, device_id: &str) -> String {
        self.nonces
            .entry(device_id.to_string())
            .or_insert_with(generate_nonce)
            .clone()
    }

    /// 当前未完成挑战的 nonce
    pub fn nonce(&self, device_id: &str) -> Option<String> {
        self.nonces.get(device_id).map(|n| n.clone())
    }

    /// 失败次数加一并返回新值
    pub fn record_failed_attempt(&self, device_id: &str) -> u32 {
        let mut count = self.attempts.entry(device_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, device_id: &str) -> u32 {
        self.attempts.get(device_id).map(|c| *c).unwrap_or(0)
    }

    /// 失败次数超过上限
    pub fn is_banned(&self, device_id: &str) -> bool {
        self.attempts(device_id) > self.max_attempts
    }

    /// 鉴权成功后清除挑战与失败计数
    pub fn clear_challenge(&self, device_id: &str) {
        self.nonces.remove(device_id);
        self.attempts.remove(device_id);
    }

    /// 清除所有超过上限的失败计数，返回清除数量
    pub fn sweep_bans(&self) -> usize {
        let before = self.attempts.len();
        let max = self.max_attempts;
        self.attempts.retain(|_, count| *count <= max);
        before.saturating_sub(self.attempts.len())
    }

    /// 周期性解除封禁
    pub fn spawn_ban_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
            // 第一次 tick 立即返回
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = registry.sweep_bans();
                if removed > 0 {
                    tracing::info!(target: "gb28181::sip", removed, "Cleared register bans");
                }
            }
        })
    }

    pub fn find(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub async fn find_channel(&self, device_id: &str, channel_id: &str) -> Option<Channel> {
        let device = self.find(device_id)?;
        device.channel(channel_id).await
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
