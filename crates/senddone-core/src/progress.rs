//! 传输进度与速度采样

use std::time::{Duration, Instant};

/// 两次采样间隔小于该值时沿用上一次的速度
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// 字节计数与速度采样
///
/// 速度定义为“距上次采样新增的字节数 / 经过的时间”，所以每次
/// [`Progress::sample_speed`] 都会推进采样点。
#[derive(Debug, Clone)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub started_at: Instant,
    last_sample_at: Instant,
    last_sample_bytes: u64,
    last_speed: f64,
}

impl Progress {
    pub fn new(bytes_total: u64) -> Self {
        Self::starting_at(bytes_total, Instant::now())
    }

    pub fn starting_at(bytes_total: u64, now: Instant) -> Self {
        Self {
            bytes_transferred: 0,
            bytes_total,
            started_at: now,
            last_sample_at: now,
            last_sample_bytes: 0,
            last_speed: 0.0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    /// 当前速度（字节/秒），非负
    pub fn sample_speed(&mut self) -> f64 {
        self.sample_speed_at(Instant::now())
    }

    pub fn sample_speed_at(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_sample_at);
        if elapsed < MIN_SAMPLE_INTERVAL {
            return self.last_speed;
        }
        let delta = self.bytes_transferred.saturating_sub(self.last_sample_bytes);
        self.last_speed = delta as f64 / elapsed.as_secs_f64();
        self.last_sample_at = now;
        self.last_sample_bytes = self.bytes_transferred;
        self.last_speed
    }

    /// 自开始以来的平均速度
    pub fn average_speed_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / elapsed
    }
}
