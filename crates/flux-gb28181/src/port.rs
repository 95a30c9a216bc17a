// 媒体端口分配
// 每个会话独占一个端口，范围无效时调用方退回到单一固定端口

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PortRange {
    min: u16,
    max: u16,
    cursor: u16,
    valid: bool,
    in_use: HashSet<u16>,
}

/// 端口管理器
#[derive(Debug, Default)]
pub struct PortManager {
    inner: Mutex<PortRange>,
}

impl PortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用 `[min, max]` 初始化；两端都非零且 `min <= max` 时范围有效
    pub fn init(&self, min: u16, max: u16) {
        let mut range = self.lock();
        range.min = min;
        range.max = max;
        range.cursor = min;
        range.valid = min != 0 && max != 0 && min <= max;
        range.in_use.clear();
    }

    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    /// 分配下一个空闲端口，游标到达上界后回绕
    ///
    /// 范围无效或所有端口都被占用时返回 None。
    pub fn allocate(&self) -> Option<u16> {
        let mut range = self.lock();
        if !range.valid {
            return None;
        }

        let size = u32::from(range.max - range.min) + 1;
        for _ in 0..size {
            let candidate = range.cursor;
            range.cursor = if candidate >= range.max {
                range.min
            } else {
                candidate + 1
            };

            if range.in_use.insert(candidate) {
                return Some(candidate);
            }
        }

        None
    }

    /// 归还端口
    pub fn release(&self, port: u16) {
        self.lock().in_use.remove(&port);
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use.len()
    }

    fn lock(&self) -> MutexGuard<'_, PortRange> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_invalid_ranges() {
        let pm = PortManager::new();
        assert!(!pm.is_valid());
        assert_eq!(pm.allocate(), None);

        pm.init(0, 100);
        assert!(!pm.is_valid());

        pm.init(100, 0);
        assert!(!pm.is_valid());

        pm.init(200, 100);
        assert!(!pm.is_valid());
        assert_eq!(pm.allocate(), None);

        pm.init(100, 100);
        assert!(pm.is_valid());
    }

    #[test]
    fn test_allocate_wraps_and_exhausts() {
        let pm = PortManager::new();
        pm.init(30000, 30002);

        assert_eq!(pm.allocate(), Some(30000));
        assert_eq!(pm.allocate(), Some(30001));
        assert_eq!(pm.allocate(), Some(30002));
        assert_eq!(pm.allocate(), None);

        pm.release(30001);
        assert_eq!(pm.allocate(), Some(30001));
        assert_eq!(pm.in_use(), 3);
    }

    #[test]
    fn test_cursor_skips_ports_in_use() {
        let pm = PortManager::new();
        pm.init(40000, 40003);

        let a = pm.allocate().unwrap();
        let b = pm.allocate().unwrap();
        pm.release(a);

        // 游标继续向前，不会立即复用刚归还的端口
        assert_eq!(pm.allocate(), Some(40002));
        assert_eq!(pm.allocate(), Some(40003));
        assert_eq!(pm.allocate(), Some(a));
        assert_ne!(a, b);
        assert_eq!(pm.allocate(), None);
    }

    #[test]
    fn test_top_of_u16_range() {
        let pm = PortManager::new();
        pm.init(65534, 65535);
        assert_eq!(pm.allocate(), Some(65534));
        assert_eq!(pm.allocate(), Some(65535));
        assert_eq!(pm.allocate(), None);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let pm = Arc::new(PortManager::new());
        pm.init(50000, 50999);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pm = pm.clone();
                std::thread::spawn(move || {
                    (0..100).filter_map(|_| pm.allocate()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for port in h.join().unwrap() {
                assert!(all.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(all.len(), 800);
    }
}
