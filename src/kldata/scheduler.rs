//! 周期任务调度
//!
//! 任务启动后立即执行一次，成功后按固定间隔执行；失败后按指数退避重试，
//! 退避上限为配置值与正常间隔中较小者。任务失败永远不会让调度器退出。

use crate::klcommon::config::SchedulerConfig;
use crate::klcommon::Result;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info};

/// 指数退避状态
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), current: None }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.initial_backoff_secs),
            Duration::from_secs(config.max_backoff_secs),
        )
    }

    /// 连续失败时的下一次等待时长
    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// 运行一个周期任务，直到进程退出
pub async fn run_periodic<F, Fut>(name: &'static str, interval: Duration, mut backoff: Backoff, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(target: "scheduler", log_type = "module", job = name, interval_secs = interval.as_secs(), "周期任务启动");

    loop {
        let delay = match job().await {
            Ok(()) => {
                backoff.reset();
                interval
            }
            Err(e) => {
                let delay = backoff.next_delay().min(interval);
                error!(
                    target: "scheduler",
                    job = name,
                    decision = "backoff",
                    retry_in_secs = delay.as_secs(),
                    error.summary = e.get_error_type_summary(),
                    error.details = %e,
                    "周期任务执行失败"
                );
                delay
            }
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(120));
        assert_eq!(backoff.next_delay(), Duration::from_secs(240));
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));
        assert_eq!(backoff.next_delay(), Duration::from_secs(300));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_running() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let handle = tokio::spawn(run_periodic(
            "always_fails",
            Duration::from_secs(3600),
            Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AppError::DatabaseError("database is locked".to_string()))
                }
            },
        ));

        // 退避依次为 1s, 2s, 4s, 4s
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        handle.abort();

        assert_eq!(runs.load(Ordering::SeqCst), 5, "失败后调度器应继续按退避重试");
    }
}
