use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, histogram};
use telemetry_common::deadletter::DeadLetterError;
use telemetry_common::timeseries::StorageError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum CleanerError {
    #[error("invalid cleaner mode: {0}")]
    InvalidCleanerMode(String),
    #[error("no cleaner modes configured")]
    NoCleanerModes,
    #[error("dead-letter retention failed: {0}")]
    DeadLetters(#[from] DeadLetterError),
    #[error("partition maintenance failed: {0}")]
    Partitions(#[from] StorageError),
}

// Mode names, used by config/environment parsing to verify the mode is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanerModeName {
    DeadLetters,
    Partitions,
}

impl FromStr for CleanerModeName {
    type Err = CleanerError;

    fn from_str(s: &str) -> Result<Self, CleanerError> {
        match s.trim() {
            "dead_letters" => Ok(CleanerModeName::DeadLetters),
            "partitions" => Ok(CleanerModeName::Partitions),
            invalid => Err(CleanerError::InvalidCleanerMode(invalid.to_owned())),
        }
    }
}

/// Parses a comma separated mode list, dropping duplicates.
pub fn parse_modes(modes: &str) -> Result<Vec<CleanerModeName>, CleanerError> {
    let mut parsed = Vec::new();
    for mode in modes.split(',').filter(|mode| !mode.trim().is_empty()) {
        let mode = CleanerModeName::from_str(mode)?;
        if !parsed.contains(&mode) {
            parsed.push(mode);
        }
    }
    if parsed.is_empty() {
        return Err(CleanerError::NoCleanerModes);
    }
    Ok(parsed)
}

#[async_trait]
pub trait Cleaner: Send + Sync {
    fn name(&self) -> &'static str;

    /// One maintenance pass, returning how many rows or partitions it touched.
    async fn cleanup(&self) -> Result<u64, CleanerError>;
}

/// Runs every cleaner once. Returns false if any of them failed.
pub async fn run_cleaners(cleaners: &[Box<dyn Cleaner>]) -> bool {
    let mut healthy = true;
    for cleaner in cleaners {
        let start = std::time::Instant::now();
        match cleaner.cleanup().await {
            Ok(affected) => {
                info!(cleaner = cleaner.name(), affected, "cleanup finished");
                counter!("telemetry_janitor_runs_total", "cleaner" => cleaner.name(), "result" => "ok")
                    .increment(1);
                counter!("telemetry_janitor_affected_total", "cleaner" => cleaner.name())
                    .increment(affected);
            }
            Err(e) => {
                error!(cleaner = cleaner.name(), "cleanup failed: {}", e);
                counter!("telemetry_janitor_runs_total", "cleaner" => cleaner.name(), "result" => "error")
                    .increment(1);
                healthy = false;
            }
        }
        histogram!("telemetry_janitor_run_duration_seconds", "cleaner" => cleaner.name())
            .record(start.elapsed().as_secs_f64());
    }
    healthy
}

/// Runs the cleaners every `interval` until cancelled, reporting liveness after each clean pass.
pub async fn cleanup_loop(
    cleaners: Vec<Box<dyn Cleaner>>,
    interval: Duration,
    liveness: HealthHandle,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        if run_cleaners(&cleaners).await {
            liveness.report_healthy().await;
        }
    }

    info!("cleanup loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use health::HealthRegistry;

    use super::*;

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Cleaner for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn cleanup(&self) -> Result<u64, CleanerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CleanerError::DeadLetters(DeadLetterError::Unavailable(
                    "down".to_owned(),
                )))
            } else {
                Ok(3)
            }
        }
    }

    #[test]
    fn parses_mode_lists() {
        assert_eq!(
            parse_modes("dead_letters, partitions,dead_letters").unwrap(),
            vec![CleanerModeName::DeadLetters, CleanerModeName::Partitions]
        );
        assert_eq!(
            parse_modes("partitions").unwrap(),
            vec![CleanerModeName::Partitions]
        );
        assert!(matches!(
            parse_modes("dead_letters,webhooks"),
            Err(CleanerError::InvalidCleanerMode(mode)) if mode == "webhooks"
        ));
        assert!(matches!(parse_modes(" , "), Err(CleanerError::NoCleanerModes)));
    }

    #[tokio::test]
    async fn one_failure_keeps_the_others_running() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cleaners: Vec<Box<dyn Cleaner>> = vec![
            Box::new(Counting {
                runs: runs.clone(),
                fail: true,
            }),
            Box::new(Counting {
                runs: runs.clone(),
                fail: false,
            }),
        ];

        assert!(!run_cleaners(&cleaners).await);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn loop_reports_liveness_and_stops_on_cancel() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("cleanup".to_owned(), Duration::from_secs(60))
            .await;
        let runs = Arc::new(AtomicUsize::new(0));
        let cleaners: Vec<Box<dyn Cleaner>> = vec![Box::new(Counting {
            runs: runs.clone(),
            fail: false,
        })];
        let token = CancellationToken::new();

        let running = tokio::spawn(cleanup_loop(
            cleaners,
            Duration::from_millis(10),
            liveness,
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("cleanup loop did not stop")
            .unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn failing_runs_do_not_report_liveness() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry
            .register("cleanup".to_owned(), Duration::from_secs(60))
            .await;
        let cleaners: Vec<Box<dyn Cleaner>> = vec![Box::new(Counting {
            runs: Arc::new(AtomicUsize::new(0)),
            fail: true,
        })];
        let token = CancellationToken::new();

        let running = tokio::spawn(cleanup_loop(
            cleaners,
            Duration::from_millis(10),
            liveness,
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        running.await.unwrap();

        assert!(!registry.get_status().healthy);
    }
}
