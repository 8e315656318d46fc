//! One fetch-normalize-score cycle.
//!
//! A [`PipelineRun`] is immutable once built; callers share it through the
//! cache as `Arc<PipelineRun>` and derive stats and analytics from it.

use chrono::{Duration, NaiveDateTime};

use crate::error::EngineError;
use crate::normalize::{normalize, NormalizeOptions, NormalizedBatch};
use crate::risk_engine;
use crate::source::{FetchWindow, RawBatch, SourceAdapter};
use crate::types::{Config, Member};

#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Unique per build. Values derived from a run are cached under this id.
    pub id: String,
    /// The instant every day count in this run was measured against.
    pub generated_at: NaiveDateTime,
    /// Members are scored and sorted by descending score, then ref.
    pub batch: NormalizedBatch,
}

impl PipelineRun {
    pub fn members(&self) -> &[Member] {
        &self.batch.members
    }
}

/// Date bounds handed to the source for a run at `now`.
pub fn fetch_window(config: &Config, now: NaiveDateTime) -> FetchWindow {
    FetchWindow {
        visits_from: (now - Duration::days(config.visit_lookback_days)).date(),
        payments_from: config.ltv_window_start,
    }
}

/// Normalize and score a raw batch.
pub fn build_run(raw: &RawBatch, config: &Config, now: NaiveDateTime) -> PipelineRun {
    let mut batch = normalize(raw, &NormalizeOptions::from_config(config), now);

    for member in &mut batch.members {
        member.risk_assessment = risk_engine::score(member, now);
    }
    batch.members.sort_by(|a, b| {
        b.risk_assessment
            .score
            .cmp(&a.risk_assessment.score)
            .then_with(|| a.member_ref.cmp(&b.member_ref))
    });

    PipelineRun {
        id: uuid::Uuid::new_v4().to_string(),
        generated_at: now,
        batch,
    }
}

/// Fetch from `source` and build a run.
pub async fn run(
    source: &dyn SourceAdapter,
    config: &Config,
    now: NaiveDateTime,
) -> Result<PipelineRun, EngineError> {
    let window = fetch_window(config, now);
    log::info!(
        "Fetching source {} (visits from {}, payments from {})",
        source.identity(),
        window.visits_from,
        window.payments_from
    );
    let raw = source.fetch(window).await?;
    let run = build_run(&raw, config, now);
    log::info!(
        "Pipeline run: {} active members, {} at risk",
        run.members().len(),
        run.members()
            .iter()
            .filter(|m| m.risk_assessment.level.is_at_risk())
            .count()
    );
    Ok(run)
}
