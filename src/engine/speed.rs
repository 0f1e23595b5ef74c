//! 滑动窗口速度计

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 默认统计窗口
const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// 滑动窗口速度计
///
/// 记录 (时间, 累计字节) 样本，速度 = 窗口内字节增量 / 窗口跨度
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// 记录累计字节数
    pub fn record(&mut self, total_bytes: u64) {
        self.record_at(Instant::now(), total_bytes);
    }

    fn record_at(&mut self, now: Instant, total_bytes: u64) {
        self.samples.push_back((now, total_bytes));
        self.trim(now);
    }

    /// 当前速度 (bytes/s)
    pub fn speed(&mut self) -> u64 {
        self.speed_at(Instant::now())
    }

    fn speed_at(&mut self, now: Instant) -> u64 {
        self.trim(now);

        let (Some(&(first_at, first_bytes)), Some(&(_, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0;
        };

        let elapsed = now.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (last_bytes.saturating_sub(first_bytes) as f64 / elapsed) as u64
    }

    /// 清空样本（暂停、取消时调用）
    pub fn reset(&mut self) {
        self.samples.clear();
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
