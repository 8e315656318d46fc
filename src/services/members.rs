// Member service: cached pipeline runs, member lists, stats, refresh and
// the daily outreach list.

use std::sync::Arc;

use chrono::Utc;

use crate::analytics::{ltv_summary, round1};
use crate::error::EngineError;
use crate::outreach::{self, OutreachMessage};
use crate::pipeline::{self, PipelineRun};
use crate::state::{EngineState, RefreshRecord};
use crate::types::{Member, MemberFilter, Stats};

pub const MEMBERS_KEY: &str = "members";
pub const STATS_KEY: &str = "stats";

/// Weeks per month used to turn 30-day counts into a weekly average.
const WEEKS_PER_MONTH: f64 = 4.3;

/// The cached pipeline run, fetching upstream on a miss.
pub(crate) async fn load_run(state: &EngineState) -> Result<Arc<PipelineRun>, EngineError> {
    let key = state.cache_key(MEMBERS_KEY);
    let (run, fresh) = state
        .runs
        .get_or_compute_within(&key, state.config.fetch_timeout(), || {
            pipeline::run(state.source.as_ref(), &state.config, state.now())
        })
        .await?;
    if fresh {
        log::debug!("Pipeline run {} computed on this call", key);
    }
    Ok(run)
}

/// Active members matching `filter`, highest risk first.
pub async fn list_members(
    state: &EngineState,
    filter: MemberFilter,
    limit: Option<usize>,
) -> Result<Vec<Member>, EngineError> {
    let run = load_run(state).await?;
    Ok(run
        .members()
        .iter()
        .filter(|m| filter.matches(m))
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect())
}

/// Dashboard counters over a set of scored members.
pub fn compute_stats(members: &[Member]) -> Stats {
    let total = members.len();
    let avg_checkins_per_week = if total == 0 {
        0.0
    } else {
        let visits: u32 = members.iter().map(|m| m.visits_30d).sum();
        round1(visits as f64 / total as f64 / WEEKS_PER_MONTH)
    };
    let ltv = ltv_summary(members);

    Stats {
        total_members: total,
        at_risk: members
            .iter()
            .filter(|m| m.risk_assessment.level.is_at_risk())
            .count(),
        critical_risk: members
            .iter()
            .filter(|m| MemberFilter::Critical.matches(m))
            .count(),
        avg_checkins_per_week,
        total_ltv: ltv.total_ltv,
        avg_ltv: ltv.avg_ltv,
        members_with_payments: ltv.members_with_payments,
    }
}

/// Stats for the current pipeline run. The cached value is only reused
/// while it was derived from that same run.
pub async fn get_stats(state: &EngineState) -> Result<Arc<Stats>, EngineError> {
    let run = load_run(state).await?;
    let (stats, _) = state
        .stats
        .get_or_compute_tagged(&state.cache_key(STATS_KEY), Some(run.id.as_str()), || async {
            Ok::<_, EngineError>(compute_stats(run.members()))
        })
        .await?;
    Ok(stats)
}

/// Today's outreach candidates. `limit` defaults to `outreachDailyLimit`.
pub async fn outreach_today(
    state: &EngineState,
    limit: Option<usize>,
) -> Result<Vec<OutreachMessage>, EngineError> {
    let run = load_run(state).await?;
    let limit = limit.unwrap_or(state.config.outreach_daily_limit);
    Ok(outreach::select_candidates(run.members(), limit, run.generated_at))
}

/// Recompute every cached result now, regardless of age.
///
/// A failure leaves all caches as they were and is recorded in the refresh
/// history.
pub async fn refresh(state: &EngineState) -> Result<RefreshRecord, EngineError> {
    let id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let result = refresh_all(state).await;

    let record = RefreshRecord {
        id,
        started_at,
        finished_at: Utc::now(),
        member_count: result.as_ref().ok().copied(),
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    state.add_refresh_record(record.clone());

    match result {
        Ok(count) => {
            log::info!("Refresh {} complete: {} members", record.id, count);
            Ok(record)
        }
        Err(e) => {
            log::warn!("Refresh {} failed: {}", record.id, e);
            Err(e)
        }
    }
}

async fn refresh_all(state: &EngineState) -> Result<usize, EngineError> {
    let limit = state.config.fetch_timeout();
    let members_key = state.cache_key(MEMBERS_KEY);
    let recompute = state
        .runs
        .recompute(&members_key, || {
            pipeline::run(state.source.as_ref(), &state.config, state.now())
        });
    let run = tokio::time::timeout(limit, recompute)
        .await
        .map_err(|_| EngineError::Timeout(limit.as_secs()))??;

    state
        .stats
        .recompute_tagged(&state.cache_key(STATS_KEY), Some(run.id.as_str()), || async {
            Ok::<_, EngineError>(compute_stats(run.members()))
        })
        .await?;
    super::analytics::recompute_snapshot(state, &run).await?;

    Ok(run.members().len())
}
