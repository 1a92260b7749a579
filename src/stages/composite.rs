use super::{StageContext, StageError, StageExecutor, StageOutput, StagePayload};
use crate::models::TaskKind;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Runs acquire, transform and deliver back to back inside one job.
///
/// Each stage gets a third of the progress range. The output of a stage becomes the
/// `source_spec` of the next; target and processing specs are passed through unchanged.
pub struct CompositeExecutor {
    stages: [(TaskKind, Arc<dyn StageExecutor>); 3],
}

impl CompositeExecutor {
    pub fn new(
        acquire: Arc<dyn StageExecutor>,
        transform: Arc<dyn StageExecutor>,
        deliver: Arc<dyn StageExecutor>,
    ) -> Self {
        Self {
            stages: [
                (TaskKind::Acquire, acquire),
                (TaskKind::Transform, transform),
                (TaskKind::Deliver, deliver),
            ],
        }
    }
}

#[async_trait]
impl StageExecutor for CompositeExecutor {
    async fn run(&self, payload: StagePayload, ctx: StageContext) -> Result<StageOutput, StageError> {
        let span = 1.0 / self.stages.len() as f64;
        let last = self.stages.len().saturating_sub(1);
        let mut payload = payload;
        let mut output = StageOutput::empty();

        for (index, (kind, executor)) in self.stages.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            let offset = index as f64 * span;
            debug!(task_id = %ctx.task_id, stage = %kind, "Composite stage starting");
            let stage_ctx = ctx.for_substage(*kind, offset, span);
            output = executor.run(payload.clone(), stage_ctx).await?;
            // 1.0 is left to the completion update
            if index < last {
                ctx.report_progress(offset + span, Some(kind.as_str()));
            }

            payload.source_spec = output.data.clone();
        }

        Ok(output)
    }

    fn name(&self) -> &str {
        "composite"
    }
}
