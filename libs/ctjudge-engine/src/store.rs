/// Result Store - latest state and result of every submission
///
/// In-memory map shared by the workers and external readers. Each record is
/// written only by the single worker driving that submission until it
/// reaches Done, after which it is read-only; the store enforces the
/// monotonic Queued -> Running -> Done lifecycle so a late or duplicate
/// write can never move a submission backwards.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use ctjudge_common::error::QueryError;
use ctjudge_common::types::{JudgeVerdict, SubmissionRecord, SubmissionStatus};

/// Cooperative cancellation signal for one submission. Checked by the
/// scheduler before dispatch and by the grader between test cases.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ResultStore {
    records: DashMap<Uuid, SubmissionRecord>,
    cancel_flags: DashMap<Uuid, CancelFlag>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly queued submission.
    pub fn insert_queued(&self, record: SubmissionRecord) {
        let id = record.submission_id;
        self.cancel_flags.insert(id, CancelFlag::new());
        self.records.insert(id, record);
    }

    /// Queued -> Running. Ignored (with a log) on any other current state,
    /// so a stray transition can never rewind a finished submission.
    pub fn set_running(&self, id: Uuid) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if record.status == SubmissionStatus::Queued {
                record.status = SubmissionStatus::Running;
                record.queue_position = None;
            } else {
                warn!(submission_id = %id, status = ?record.status, "ignoring stale Running transition");
            }
        }
    }

    /// -> Done, exactly once. The verdict is merged into the record and the
    /// record becomes immutable.
    pub fn complete(&self, id: Uuid, verdict: JudgeVerdict) {
        if let Some(mut record) = self.records.get_mut(&id) {
            if record.status == SubmissionStatus::Done {
                warn!(submission_id = %id, "ignoring duplicate Done transition");
                return;
            }
            record.status = SubmissionStatus::Done;
            record.result = Some(verdict.kind);
            record.passed_tests = verdict.passed_tests;
            record.total_tests = verdict.total_tests;
            record.has_error = verdict.has_error;
            record.execution_time_ms = verdict.execution_time_ms;
            record.memory_used_kb = verdict.memory_used_kb;
            record.error_message = verdict.error_message;
            record.details = verdict.details;
            record.completed_at = Some(Utc::now());
            record.queue_position = None;
        }
        self.cancel_flags.remove(&id);
    }

    /// Drop a record that never made it into the queue.
    pub fn discard(&self, id: Uuid) {
        self.records.remove(&id);
        self.cancel_flags.remove(&id);
    }

    pub fn snapshot(&self, id: Uuid) -> Result<SubmissionRecord, QueryError> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or(QueryError::NotFound(id))
    }

    /// Terminal result only; polling callers get NotReady until Done.
    pub fn result_of(&self, id: Uuid) -> Result<SubmissionRecord, QueryError> {
        let record = self.snapshot(id)?;
        if record.status != SubmissionStatus::Done {
            return Err(QueryError::NotReady(id));
        }
        Ok(record)
    }

    pub fn cancel_flag(&self, id: Uuid) -> Option<CancelFlag> {
        self.cancel_flags.get(&id).map(|f| f.clone())
    }

    /// Request cancellation. A no-op for already-finished submissions.
    pub fn request_cancel(&self, id: Uuid) -> Result<(), QueryError> {
        if !self.records.contains_key(&id) {
            return Err(QueryError::NotFound(id));
        }
        if let Some(flag) = self.cancel_flags.get(&id) {
            flag.cancel();
        }
        Ok(())
    }
}
