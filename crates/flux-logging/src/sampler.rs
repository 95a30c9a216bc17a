use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 采样策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// 始终记录
    Always,

    /// 从不记录
    Never,

    /// 速率限制（每秒最多 N 条）
    RateLimit(u32),

    /// 固定间隔内最多记录一条
    Interval(Duration),
}

/// 日志采样器
///
/// 用于高频路径（逐包处理）上的告警，避免日志风暴。
/// 判断是同步的，可以在收包循环里直接调用。
pub struct LogSampler {
    strategy: SamplingStrategy,
    counter: AtomicU64,
    window: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
}

impl LogSampler {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
            window: Mutex::new(None),
            suppressed: AtomicU64::new(0),
        }
    }

    /// 判断是否应该采样
    pub fn should_sample(&self) -> bool {
        let sampled = match &self.strategy {
            SamplingStrategy::Always => true,
            SamplingStrategy::Never => false,
            SamplingStrategy::RateLimit(max_per_sec) => self.check_rate_limit(*max_per_sec),
            SamplingStrategy::Interval(period) => self.check_interval(*period),
        };

        if !sampled {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
        }
        sampled
    }

    fn check_rate_limit(&self, max_per_sec: u32) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        // 每秒重置计数器
        match *window {
            Some(start) if now.duration_since(start) < Duration::from_secs(1) => {}
            _ => {
                self.counter.store(0, Ordering::Relaxed);
                *window = Some(now);
            }
        }

        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        count < u64::from(max_per_sec)
    }

    fn check_interval(&self, period: Duration) -> bool {
        let now = Instant::now();
        let mut last = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        match *last {
            Some(prev) if now.duration_since(prev) < period => false,
            _ => {
                *last = Some(now);
                self.counter.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// 取出并清零被丢弃的日志条数
    pub fn take_suppressed(&self) -> u64 {
        self.suppressed.swap(0, Ordering::Relaxed)
    }

    /// 获取当前计数
    pub fn get_count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn strategy(&self) -> &SamplingStrategy {
        &self.strategy
    }
}

impl Default for LogSampler {
    fn default() -> Self {
        Self::new(SamplingStrategy::Always)
    }
}
