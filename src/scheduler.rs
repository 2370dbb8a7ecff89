//! 每日定时重启的计时

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::utils::{BootstrapError, Result};

const DAY_SECS: u64 = 24 * 60 * 60;

/// 解析 HH:MM 或 HH:MM:SS
pub fn parse_restart_time(text: &str) -> Result<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| BootstrapError::Scheduling(format!("无效的重启时间: {}", text)))
}

/// 解析 +HH:MM / -HH:MM，也接受 Z 与 UTC
pub fn parse_utc_offset(text: &str) -> Result<FixedOffset> {
    let text = text.trim();
    let invalid = || BootstrapError::Scheduling(format!("无效的时区偏移: {}", text));

    if text.eq_ignore_ascii_case("z") || text.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match text.as_bytes().first() {
        Some(b'+') => (1, &text[1..]),
        Some(b'-') => (-1, &text[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// 距离下一次 at 的时长
///
/// 当天的时刻已过 (或恰好是现在) 时取次日；结果总是在 (0, 24h] 之内。
pub fn delay_until_next<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> Duration {
    let naive_now = now.naive_local();
    let today = naive_now.date().and_time(at);
    let target = if today > naive_now {
        today
    } else {
        match naive_now.date().succ_opt() {
            Some(next) => next.and_time(at),
            None => return Duration::from_secs(DAY_SECS),
        }
    };

    match (target - naive_now).to_std() {
        Ok(delay) if !delay.is_zero() && delay.as_secs() <= DAY_SECS => delay,
        _ => Duration::from_secs(DAY_SECS),
    }
}

/// 每天在固定的本地时刻发出一次重启信号
pub struct RestartScheduler {
    at: NaiveTime,
    offset: FixedOffset,
}

impl RestartScheduler {
    pub fn new(at: NaiveTime, offset: FixedOffset) -> Self {
        Self { at, offset }
    }

    pub fn from_config(at: &str, utc_offset: &str) -> Result<Self> {
        Ok(Self::new(parse_restart_time(at)?, parse_utc_offset(utc_offset)?))
    }

    pub fn next_delay(&self) -> Duration {
        let now = Utc::now().with_timezone(&self.offset);
        delay_until_next(&now, self.at)
    }

    /// 启动计时任务；每次触发后重新计算下一次，接收端关闭时结束
    pub fn spawn(self, tx: mpsc::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let delay = self.next_delay();
                info!(
                    "⏰ 下次定时重启 {} (UTC{})，约 {} 秒后",
                    self.at.format("%H:%M:%S"),
                    self.offset,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;

                if tx.send(()).await.is_err() {
                    debug!("重启信号接收端已关闭，计时任务结束");
                    break;
                }
            }
        })
    }
}
