use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use telemetry_common::deadletter::DeadLetterStore;
use tracing::debug;

use crate::cleanup::{Cleaner, CleanerError};

/// Removes dead letters whose first failure is older than the retention window.
pub struct DeadLetterCleaner {
    store: Arc<dyn DeadLetterStore>,
    retention: Duration,
    batch_limit: i64,
}

impl DeadLetterCleaner {
    pub fn new(store: Arc<dyn DeadLetterStore>, retention_days: u32, batch_limit: u32) -> Self {
        Self {
            store,
            retention: Duration::days(i64::from(retention_days)),
            batch_limit: i64::from(batch_limit.max(1)),
        }
    }
}

#[async_trait]
impl Cleaner for DeadLetterCleaner {
    fn name(&self) -> &'static str {
        "dead_letters"
    }

    async fn cleanup(&self) -> Result<u64, CleanerError> {
        let cutoff = Utc::now() - self.retention;
        let mut deleted = 0;
        loop {
            let batch = self
                .store
                .delete_older_than(cutoff, self.batch_limit)
                .await?;
            deleted += batch;
            debug!(batch, cutoff = %cutoff, "deleted expired dead letters");
            if batch < self.batch_limit as u64 {
                break;
            }
        }
        Ok(deleted)
    }
}
