//! Reconcile COMPLETED ledger records against the object store.

use crate::ledger::{LedgerError, SyncLedger, SyncRecord};
use crate::store::{ObjectStore, StoreError};
use crate::sync::keys::TAG_ITEM_ID;
use crate::sync::transfer::NOTE_SOURCE_DELETED;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProblemKind {
    /// COMPLETED without a destination key.
    NoKey,
    Missing,
    SizeMismatch { recorded: u64, actual: u64 },
    /// The object at the key carries another item's id (or none).
    TagMismatch { found: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub provider: String,
    pub item_id: String,
    pub key: Option<String>,
    pub kind: ProblemKind,
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = self.key.as_deref().unwrap_or("-");
        match &self.kind {
            ProblemKind::NoKey => write!(
                f,
                "NO KEY: {}/{} - no destination key recorded",
                self.provider, self.item_id
            ),
            ProblemKind::Missing => write!(f, "MISSING: {} ({})", key, self.item_id),
            ProblemKind::SizeMismatch { recorded, actual } => write!(
                f,
                "SIZE MISMATCH: {} ({}) - ledger {} bytes, store {} bytes",
                key, self.item_id, recorded, actual
            ),
            ProblemKind::TagMismatch { found } => write!(
                f,
                "TAG MISMATCH: {} ({}) - object tagged {}",
                key,
                self.item_id,
                found.as_deref().unwrap_or("<untagged>")
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub verified: usize,
    /// Completed because the source vanished; nothing to check.
    pub source_deleted: usize,
    pub problems: Vec<Problem>,
    /// Multipart sessions never completed nor aborted.
    pub orphaned_uploads: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty() && self.orphaned_uploads.is_empty()
    }
}

fn recorded_size(record: &SyncRecord) -> Option<u64> {
    record
        .bytes_transferred
        .or((record.expected_size > 0).then_some(record.expected_size))
}

pub async fn reconcile(
    ledger: &dyn SyncLedger,
    store: &dyn ObjectStore,
) -> Result<VerifyReport, VerifyError> {
    let mut report = VerifyReport::default();

    for record in ledger.completed_records().await? {
        if record.note.as_deref() == Some(NOTE_SOURCE_DELETED) {
            report.source_deleted += 1;
            continue;
        }
        let problem = |kind| Problem {
            provider: record.provider.clone(),
            item_id: record.item_id.clone(),
            key: record.destination_key.clone(),
            kind,
        };
        let Some(key) = record.destination_key.as_deref() else {
            report.problems.push(problem(ProblemKind::NoKey));
            continue;
        };
        let Some(head) = store.head_object(key).await? else {
            report.problems.push(problem(ProblemKind::Missing));
            continue;
        };
        if let Some(recorded) = recorded_size(&record) {
            if recorded != head.size {
                report.problems.push(problem(ProblemKind::SizeMismatch {
                    recorded,
                    actual: head.size,
                }));
                continue;
            }
        }
        let tagged = head.tags.get(TAG_ITEM_ID);
        if tagged != Some(&record.item_id) {
            report.problems.push(problem(ProblemKind::TagMismatch {
                found: tagged.cloned(),
            }));
            continue;
        }
        report.verified += 1;
    }

    report.orphaned_uploads = store.pending_uploads().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{SqliteLedger, SyncStatus};
    use crate::store::memory::MemoryObjectStore;
    use crate::store::ObjectAttributes;

    fn tagged(item_id: &str) -> ObjectAttributes {
        let mut attributes = ObjectAttributes::default();
        attributes
            .tags
            .insert(TAG_ITEM_ID.to_string(), item_id.to_string());
        attributes
    }

    async fn completed(
        ledger: &SqliteLedger,
        item_id: &str,
        key: Option<&str>,
        size: u64,
        note: Option<&str>,
    ) {
        let mut record = SyncRecord::new("gopro", item_id, "GH01.MP4", size, SyncStatus::Completed);
        record.destination_key = key.map(String::from);
        record.bytes_transferred = key.map(|_| size);
        record.note = note.map(String::from);
        ledger.put(&record, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_store_verifies() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let store = MemoryObjectStore::new();
        completed(&ledger, "a", Some("gopro-videos/2024/03/GH01.MP4"), 4, None).await;
        store.insert("gopro-videos/2024/03/GH01.MP4", b"abcd", tagged("a"));
        completed(&ledger, "gone", None, 0, Some(NOTE_SOURCE_DELETED)).await;

        let report = reconcile(&ledger, &store).await.unwrap();
        assert_eq!(report.verified, 1);
        assert_eq!(report.source_deleted, 1);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_reports_each_problem() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let store = MemoryObjectStore::new();
        completed(&ledger, "missing", Some("k/missing.MP4"), 4, None).await;
        completed(&ledger, "short", Some("k/short.MP4"), 10, None).await;
        store.insert("k/short.MP4", b"abc", tagged("short"));
        completed(&ledger, "mine", Some("k/theirs.MP4"), 3, None).await;
        store.insert("k/theirs.MP4", b"abc", tagged("theirs"));
        completed(&ledger, "nokey", None, 3, None).await;

        let report = reconcile(&ledger, &store).await.unwrap();
        assert_eq!(report.verified, 0);
        assert!(!report.is_clean());

        let kind_of = |id: &str| {
            report
                .problems
                .iter()
                .find(|p| p.item_id == id)
                .map(|p| p.kind.clone())
        };
        assert_eq!(kind_of("missing"), Some(ProblemKind::Missing));
        assert_eq!(
            kind_of("short"),
            Some(ProblemKind::SizeMismatch {
                recorded: 10,
                actual: 3
            })
        );
        assert_eq!(
            kind_of("mine"),
            Some(ProblemKind::TagMismatch {
                found: Some("theirs".into())
            })
        );
        assert_eq!(kind_of("nokey"), Some(ProblemKind::NoKey));
    }

    #[tokio::test]
    async fn test_ignores_non_completed_records() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let store = MemoryObjectStore::new();
        let record = SyncRecord::new("gopro", "f", "GH02.MP4", 5, SyncStatus::Failed);
        ledger.put(&record, None).await.unwrap();

        let report = reconcile(&ledger, &store).await.unwrap();
        assert_eq!(report.verified, 0);
        assert!(report.problems.is_empty());
    }

    #[tokio::test]
    async fn test_reports_orphaned_uploads() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let store = MemoryObjectStore::new();
        let session = store
            .create_multipart("k/big.MP4", &ObjectAttributes::default())
            .await
            .unwrap();

        let report = reconcile(&ledger, &store).await.unwrap();
        assert_eq!(report.orphaned_uploads, vec![session.upload_id]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_problem_display() {
        let problem = Problem {
            provider: "gopro".into(),
            item_id: "a".into(),
            key: Some("k/a.MP4".into()),
            kind: ProblemKind::Missing,
        };
        assert_eq!(problem.to_string(), "MISSING: k/a.MP4 (a)");
    }
}
