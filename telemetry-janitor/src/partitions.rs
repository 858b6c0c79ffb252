use async_trait::async_trait;
use chrono::Utc;
use telemetry_common::timeseries::PgTimeSeriesStore;

use crate::cleanup::{Cleaner, CleanerError};

/// Keeps daily partitions of `telemetry_records` created ahead of incoming data.
pub struct PartitionCleaner {
    store: PgTimeSeriesStore,
    days_ahead: u32,
}

impl PartitionCleaner {
    pub fn new(store: PgTimeSeriesStore, days_ahead: u32) -> Self {
        Self { store, days_ahead }
    }
}

#[async_trait]
impl Cleaner for PartitionCleaner {
    fn name(&self) -> &'static str {
        "partitions"
    }

    async fn cleanup(&self) -> Result<u64, CleanerError> {
        // Today is included, late rows for yesterday land in the default partition
        let created = self
            .store
            .ensure_partitions(Utc::now().date_naive(), self.days_ahead + 1)
            .await?;
        Ok(created as u64)
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    #[ignore]
    async fn creates_missing_partitions_once(db: PgPool) {
        let cleaner = PartitionCleaner::new(PgTimeSeriesStore::new(db.clone()), 2);

        assert_eq!(cleaner.cleanup().await.unwrap(), 3);
        assert_eq!(cleaner.cleanup().await.unwrap(), 0);

        let name = format!("telemetry_records_p{}", Utc::now().date_naive().format("%Y%m%d"));
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_class WHERE relname = $1)")
                .bind(name)
                .fetch_one(&db)
                .await
                .unwrap();
        assert!(exists);
    }
}
