//! Timer service backing the periodic scheduler: cron expressions, fixed
//! rates, and one-shot at-time schedules, each firing a callback on its own
//! tokio task.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use warden_core::error::{EngineError, EngineResult};
use warden_core::types::RepeatType;

pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub enum TimerSchedule {
    Cron(Box<Schedule>),
    Rate(Duration),
    At(DateTime<Utc>),
}

/// Parse the schedule expression carried in a task record's `cron` field.
pub fn parse_schedule(repeat: RepeatType, expr: &str) -> EngineResult<TimerSchedule> {
    match repeat {
        RepeatType::Period => {
            let normalized = normalize_cron(expr)?;
            let schedule = Schedule::from_str(&normalized)
                .map_err(|_| EngineError::InvalidSchedule(expr.to_string()))?;
            Ok(TimerSchedule::Cron(Box::new(schedule)))
        }
        RepeatType::Rate => parse_rate(expr)
            .map(TimerSchedule::Rate)
            .ok_or_else(|| EngineError::InvalidSchedule(expr.to_string())),
        RepeatType::At => parse_at(expr)
            .map(TimerSchedule::At)
            .ok_or_else(|| EngineError::InvalidSchedule(expr.to_string())),
        _ => Err(EngineError::InvalidSchedule(expr.to_string())),
    }
}

/// Standard 5-field crontab syntax gets a seconds column prepended; the
/// crate-native 6/7-field syntax passes through.
fn normalize_cron(expr: &str) -> EngineResult<String> {
    let expr = expr.trim();
    match expr.split_whitespace().count() {
        5 => Ok(format!("0 {expr}")),
        6 | 7 => Ok(expr.to_string()),
        _ => Err(EngineError::InvalidSchedule(expr.to_string())),
    }
}

/// `Rate(30m)`, `30m`, or a bare number of seconds.
fn parse_rate(expr: &str) -> Option<Duration> {
    let inner = expr
        .trim()
        .strip_prefix("Rate(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(expr.trim())
        .trim();
    if let Ok(seconds) = inner.parse::<u64>() {
        return (seconds > 0).then(|| Duration::from_secs(seconds));
    }
    if inner.len() < 2 {
        return None;
    }
    let (value, unit) = inner.split_at(inner.len() - 1);
    let value: u64 = value.trim().parse().ok()?;
    if value == 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// `At(2024-05-01T10:00:00Z)` or the same timestamp in
/// `%Y-%m-%d %H:%M:%S` (interpreted as UTC).
fn parse_at(expr: &str) -> Option<DateTime<Utc>> {
    let inner = expr
        .trim()
        .strip_prefix("At(")
        .and_then(|s| s.strip_suffix(')'))
        .unwrap_or(expr.trim())
        .trim();
    DateTime::parse_from_rfc3339(inner)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(inner, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

pub struct Timer {
    schedule: TimerSchedule,
    callback: TimerCallback,
    token: CancellationToken,
    handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(schedule: TimerSchedule, callback: TimerCallback) -> Arc<Self> {
        Arc::new(Self {
            schedule,
            callback,
            token: CancellationToken::new(),
            handle: StdMutex::new(None),
        })
    }

    fn next_delay(&self) -> Option<Duration> {
        match &self.schedule {
            TimerSchedule::Cron(schedule) => {
                let next = schedule.after(&Utc::now()).next()?;
                Some((next - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            }
            TimerSchedule::Rate(interval) => Some(*interval),
            TimerSchedule::At(at) => (*at - Utc::now()).to_std().ok(),
        }
    }

    /// Arm the timer. Fails when the schedule has no future occurrence.
    pub fn run(self: &Arc<Self>) -> EngineResult<()> {
        if self.next_delay().is_none() {
            return Err(EngineError::InvalidSchedule(
                "schedule has no future occurrence".to_string(),
            ));
        }

        let timer = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = timer.next_delay() else {
                    return;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        (timer.callback)().await;
                        if matches!(timer.schedule, TimerSchedule::At(_)) {
                            return;
                        }
                    }
                    _ = timer.token.cancelled() => return,
                }
            }
        });
        *self.handle.lock().expect("timer state poisoned") = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.token.cancel();
        if let Some(handle) = self.handle.lock().expect("timer state poisoned").take() {
            handle.abort();
        }
    }
}

/// Creates timers and tears them down; the periodic schedule map owns them.
#[derive(Debug, Default)]
pub struct TimerManager;

impl TimerManager {
    pub fn create_timer(
        &self,
        repeat: RepeatType,
        expr: &str,
        callback: TimerCallback,
    ) -> EngineResult<Arc<Timer>> {
        let schedule = parse_schedule(repeat, expr)?;
        Ok(Timer::new(schedule, callback))
    }

    pub fn delete_timer(&self, timer: &Arc<Timer>) {
        timer.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn parses_five_and_six_field_cron() {
        assert!(matches!(
            parse_schedule(RepeatType::Period, "* * * * *"),
            Ok(TimerSchedule::Cron(_))
        ));
        assert!(matches!(
            parse_schedule(RepeatType::Period, "*/2 * * * * *"),
            Ok(TimerSchedule::Cron(_))
        ));
        assert!(parse_schedule(RepeatType::Period, "bogus").is_err());
    }

    #[test]
    fn parses_rate_expressions() {
        assert_eq!(parse_rate("Rate(30m)"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_rate("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_rate("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_rate("Rate(0m)"), None);
        assert_eq!(parse_rate("soon"), None);
    }

    #[test]
    fn parses_at_expressions() {
        assert!(parse_at("At(2099-01-02T03:04:05Z)").is_some());
        assert!(parse_at("2099-01-02 03:04:05").is_some());
        assert!(parse_at("eventually").is_none());
    }

    #[tokio::test]
    async fn rate_timer_fires_repeatedly_until_stopped() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let callback: TimerCallback = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let timer = Timer::new(TimerSchedule::Rate(Duration::from_millis(30)), callback);
        timer.run().expect("arm timer");
        tokio::time::sleep(Duration::from_millis(200)).await;
        timer.stop();
        let after_stop = fired.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "fired {after_stop} times");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn at_timer_in_the_past_refuses_to_arm() {
        let callback: TimerCallback = Arc::new(|| Box::pin(async {}));
        let timer = Timer::new(
            TimerSchedule::At(Utc::now() - chrono::TimeDelta::minutes(5)),
            callback,
        );
        assert!(timer.run().is_err());
    }
}
