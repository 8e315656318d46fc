use std::sync::Arc;

use crate::analytics::{compute_snapshot, AggregateSnapshot, AnalyticsOptions};
use crate::error::EngineError;
use crate::pipeline::PipelineRun;
use crate::state::EngineState;

use super::members::load_run;

pub const ANALYTICS_KEY: &str = "analytics";

/// Snapshot for one run, measured at the run's own instant.
fn snapshot_for(state: &EngineState, run: &PipelineRun) -> AggregateSnapshot {
    compute_snapshot(
        &run.batch,
        &AnalyticsOptions::from_config(&state.config),
        run.generated_at,
    )
}

/// The aggregate analytics snapshot, sharing the cached pipeline run with
/// the member operations and recomputed whenever that run changes.
pub async fn get_analytics_snapshot(state: &EngineState) -> Result<Arc<AggregateSnapshot>, EngineError> {
    let run = load_run(state).await?;
    let (snapshot, _) = state
        .analytics
        .get_or_compute_tagged(&state.cache_key(ANALYTICS_KEY), Some(run.id.as_str()), || async {
            Ok::<_, EngineError>(snapshot_for(state, &run))
        })
        .await?;
    Ok(snapshot)
}

pub(crate) async fn recompute_snapshot(
    state: &EngineState,
    run: &PipelineRun,
) -> Result<Arc<AggregateSnapshot>, EngineError> {
    state
        .analytics
        .recompute_tagged(&state.cache_key(ANALYTICS_KEY), Some(run.id.as_str()), || async {
            Ok::<_, EngineError>(snapshot_for(state, run))
        })
        .await
}
