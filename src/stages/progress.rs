use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: Uuid,
    /// Overall fraction for the task, already scaled for sub-stages
    pub fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub reported_at: DateTime<Utc>,
}

/// Fire-and-forget progress channel handed to stage executors.
///
/// The receiving side belongs to the job handler, which forwards updates to the status
/// sink. Reports after the handler stopped listening are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: Uuid,
    tx: mpsc::UnboundedSender<ProgressUpdate>,
    offset: f64,
    span: f64,
}

impl ProgressReporter {
    pub fn new(task_id: Uuid, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self {
            task_id,
            tx,
            offset: 0.0,
            span: 1.0,
        }
    }

    /// Reporter whose updates go nowhere
    pub fn noop(task_id: Uuid) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(task_id, tx)
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Report `fraction` of this reporter's range as done
    pub fn report(&self, fraction: f64, note: Option<&str>) {
        if fraction.is_nan() {
            return;
        }
        let overall = self.offset + fraction.clamp(0.0, 1.0) * self.span;
        let _ = self.tx.send(ProgressUpdate {
            task_id: self.task_id,
            fraction: overall,
            note: note.map(str::to_string),
            reported_at: Utc::now(),
        });
    }

    /// Reporter mapping `0..=1` onto `[offset, offset + span]` of this reporter's range
    pub fn scoped(&self, offset: f64, span: f64) -> Self {
        Self {
            task_id: self.task_id,
            tx: self.tx.clone(),
            offset: self.offset + offset * self.span,
            span: span * self.span,
        }
    }
}
