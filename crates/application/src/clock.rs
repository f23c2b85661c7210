use std::sync::{Mutex, PoisonError};

use chrono::{Duration, Utc};
use domain::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// 每次读取自动前进一毫秒的时钟，测试中用于得到严格递增的时间戳。
#[derive(Debug)]
pub struct SteppingClock {
    current: Mutex<Timestamp>,
}

impl SteppingClock {
    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }
}

impl Default for SteppingClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> Timestamp {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current += Duration::milliseconds(1);
        *current
    }
}
