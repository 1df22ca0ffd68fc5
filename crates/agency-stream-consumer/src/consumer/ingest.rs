use crate::{
    Error,
    cache::ExistenceCache,
    directory::{DirectoryError, EntityDirectory, EntityKind},
};
use agency_stream_core::{proto::ContractRequestBatch, types::ContractRequestRecord};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Records received in the batch.
    pub total: usize,
    /// Records whose references both exist.
    pub valid: usize,
    pub created: usize,
    pub is_final: bool,
}

/// Validates every record of `batch` and creates the valid ones.
///
/// The whole batch is decoded before anything is created, so a malformed
/// record leaves the directory untouched. A record is valid only if both its
/// counterparty and its real estate exist. Invalid records are dropped with a
/// warning; they never abort the batch.
///
/// # Errors
///
/// - [`Error::Record`] if any record does not decode.
/// - [`Error::Directory`] if the directory fails for any reason other than a
///   missing reference.
/// - [`Error::Cancelled`] if `cancel` fires; no create is issued after that.
pub async fn ingest_batch<D>(
    batch: ContractRequestBatch,
    cache: &ExistenceCache,
    directory: &D,
    cancel: &CancellationToken,
) -> Result<BatchSummary, Error>
where
    D: EntityDirectory + ?Sized,
{
    let mut summary = BatchSummary {
        total: batch.contract_requests.len(),
        is_final: batch.is_final,
        ..BatchSummary::default()
    };

    let records = batch
        .contract_requests
        .into_iter()
        .map(ContractRequestRecord::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    for record in records {
        if let Some((kind, id)) = missing_reference(&record, cache, directory).await? {
            tracing::warn!(
                %kind,
                id,
                counterparty_id = record.counterparty_id,
                real_estate_id = record.real_estate_id,
                "Dropping contract request with unknown reference"
            );
            continue;
        }
        summary.valid += 1;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match directory.create_contract_request(&record).await {
            Ok(id) => {
                tracing::debug!(id, "Created contract request");
                summary.created += 1;
            }
            // The reference disappeared after it was cached.
            Err(DirectoryError::NotFound { kind, id }) => {
                tracing::warn!(
                    %kind,
                    id,
                    counterparty_id = record.counterparty_id,
                    real_estate_id = record.real_estate_id,
                    "Contract request rejected by the directory"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(summary)
}

/// Returns the first reference of `record` that does not exist.
async fn missing_reference<D>(
    record: &ContractRequestRecord,
    cache: &ExistenceCache,
    directory: &D,
) -> Result<Option<(EntityKind, i32)>, Error>
where
    D: EntityDirectory + ?Sized,
{
    for (kind, id) in [
        (EntityKind::Counterparty, record.counterparty_id),
        (EntityKind::RealEstate, record.real_estate_id),
    ] {
        if !entity_exists(kind, id, cache, directory).await? {
            return Ok(Some((kind, id)));
        }
    }
    Ok(None)
}

async fn entity_exists<D>(
    kind: EntityKind,
    id: i32,
    cache: &ExistenceCache,
    directory: &D,
) -> Result<bool, Error>
where
    D: EntityDirectory + ?Sized,
{
    if let Some(exists) = cache.get(kind, id) {
        return Ok(exists);
    }

    let exists = directory.exists(kind, id).await?;
    cache.insert(kind, id, exists);
    Ok(exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{directory::MemoryDirectory, telemetry::capture::CapturedLogs};
    use agency_stream_core::{generator, proto::ContractRequestMessage};
    use core::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Counts existence lookups that reach the directory.
    struct CountingDirectory {
        inner: MemoryDirectory,
        lookups: AtomicUsize,
    }

    #[tonic::async_trait]
    impl EntityDirectory for CountingDirectory {
        async fn exists(&self, kind: EntityKind, id: i32) -> Result<bool, DirectoryError> {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            self.inner.exists(kind, id).await
        }

        async fn create_contract_request(
            &self,
            record: &ContractRequestRecord,
        ) -> Result<i32, DirectoryError> {
            self.inner.create_contract_request(record).await
        }
    }

    struct UnavailableDirectory;

    #[tonic::async_trait]
    impl EntityDirectory for UnavailableDirectory {
        async fn exists(&self, _: EntityKind, _: i32) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable {
                reason: "connection reset".into(),
            })
        }

        async fn create_contract_request(
            &self,
            _: &ContractRequestRecord,
        ) -> Result<i32, DirectoryError> {
            unreachable!("no record is valid without existence checks")
        }
    }

    fn message(counterparty_id: i32, real_estate_id: i32) -> ContractRequestMessage {
        let mut record = generator::generate(1).remove(0);
        record.counterparty_id = counterparty_id;
        record.real_estate_id = real_estate_id;
        record.into()
    }

    fn batch(messages: Vec<ContractRequestMessage>, is_final: bool) -> ContractRequestBatch {
        ContractRequestBatch {
            request_id: "abc".into(),
            contract_requests: messages,
            is_final,
        }
    }

    #[tokio::test]
    async fn drops_the_record_with_an_unknown_real_estate() {
        let directory = MemoryDirectory::seeded(10, 10);
        let cache = ExistenceCache::default();

        let summary = ingest_batch(
            batch(vec![message(1, 101), message(2, 999), message(3, 103)], true),
            &cache,
            &directory,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            BatchSummary {
                total: 3,
                valid: 2,
                created: 2,
                is_final: true,
            }
        );
        let created: Vec<_> = directory
            .created()
            .into_iter()
            .map(|(_, r)| (r.counterparty_id, r.real_estate_id))
            .collect();
        assert_eq!(created, vec![(1, 101), (3, 103)]);
    }

    #[tokio::test]
    async fn dropped_record_is_logged_once_with_its_references() {
        let (logs, _guard) = CapturedLogs::install();
        let directory = MemoryDirectory::seeded(10, 10);

        ingest_batch(
            batch(vec![message(1, 101), message(2, 999), message(3, 103)], true),
            &ExistenceCache::default(),
            &directory,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let warnings = logs.matching("WARN", "");
        assert_eq!(warnings.len(), 1, "{warnings:#?}");
        assert!(warnings[0].contains("Dropping contract request with unknown reference"));
        assert!(warnings[0].contains("counterparty_id=2"));
        assert!(warnings[0].contains("real_estate_id=999"));
    }

    #[tokio::test]
    async fn unknown_counterparty_skips_the_real_estate_lookup() {
        let directory = CountingDirectory {
            inner: MemoryDirectory::seeded(10, 10),
            lookups: AtomicUsize::new(0),
        };

        let summary = ingest_batch(
            batch(vec![message(42, 101)], false),
            &ExistenceCache::default(),
            &directory,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.valid, 0);
        assert_eq!(directory.lookups.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cache_bounds_directory_lookups() {
        let directory = CountingDirectory {
            inner: MemoryDirectory::seeded(10, 10),
            lookups: AtomicUsize::new(0),
        };
        let cache = ExistenceCache::default();
        let records = (0..20).map(|_| message(5, 105)).collect();

        let summary = ingest_batch(
            batch(records, false),
            &cache,
            &directory,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.created, 20);
        assert_eq!(directory.lookups.load(Ordering::Relaxed), 2);
        assert_eq!(cache.get(EntityKind::Counterparty, 5), Some(true));
    }

    #[tokio::test]
    async fn negative_answers_are_cached_too() {
        let directory = CountingDirectory {
            inner: MemoryDirectory::seeded(10, 10),
            lookups: AtomicUsize::new(0),
        };
        let cache = ExistenceCache::default();

        ingest_batch(
            batch(vec![message(1, 500), message(2, 500)], false),
            &cache,
            &directory,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // counterparties 1 and 2, real estate 500 once
        assert_eq!(directory.lookups.load(Ordering::Relaxed), 3);
        assert_eq!(cache.get(EntityKind::RealEstate, 500), Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn late_counterparty_is_seen_once_the_negative_answer_expires() {
        let directory = MemoryDirectory::seeded(10, 10);
        let cache = ExistenceCache::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let ingest = || {
            ingest_batch(
                batch(vec![message(42, 101)], false),
                &cache,
                &directory,
                &cancel,
            )
        };

        assert_eq!(ingest().await.unwrap().created, 0);

        directory.add_counterparty(42);
        assert_eq!(ingest().await.unwrap().created, 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(ingest().await.unwrap().created, 1);
        assert_eq!(directory.created_count(), 1);
    }

    #[tokio::test]
    async fn malformed_record_fails_the_batch() {
        let mut bad = message(1, 101);
        bad.created_date = "yesterday".into();

        let result = ingest_batch(
            batch(vec![bad], false),
            &ExistenceCache::default(),
            &MemoryDirectory::seeded(10, 10),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Record(_))));
    }

    #[tokio::test]
    async fn malformed_record_leaves_earlier_records_uncreated() {
        let directory = MemoryDirectory::seeded(10, 10);
        let mut bad = message(2, 102);
        bad.status = "x".repeat(51);

        let result = ingest_batch(
            batch(vec![message(1, 101), bad], false),
            &ExistenceCache::default(),
            &directory,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(Error::Record(_))));
        assert_eq!(directory.created_count(), 0);
    }

    #[tokio::test]
    async fn directory_outage_fails_the_batch() {
        let result = ingest_batch(
            batch(vec![message(1, 101)], false),
            &ExistenceCache::default(),
            &UnavailableDirectory,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::Directory(DirectoryError::Unavailable { .. }))
        ));
    }

    #[tokio::test]
    async fn cancelled_batch_creates_nothing() {
        let directory = MemoryDirectory::seeded(10, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ingest_batch(
            batch(vec![message(1, 101)], true),
            &ExistenceCache::default(),
            &directory,
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(directory.created_count(), 0);
    }
}
