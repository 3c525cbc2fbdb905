//! Industry-job matcher.
//!
//! A job is a candidate for a plan blueprint when it is a manufacturing job
//! on the same blueprint type. The score blends run-count similarity,
//! facility equality, and recency:
//! `0.5·runs + 0.3·facility + 0.2·exp(−Δdays/7)`.

use crate::error::CoreResult;
use crate::models::{now_ms, IndustryJob, PlanBlueprint, PlanJobMatch, MatchStatus};
use crate::sde::ACTIVITY_MANUFACTURING;
use crate::store::character::CharacterStore;
use crate::store::plan::PlanStore;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobMatcherConfig {
    pub min_confidence: f64,
}

impl Default for JobMatcherConfig {
    fn default() -> Self {
        Self {
            min_confidence: super::DEFAULT_MIN_CONFIDENCE,
        }
    }
}

const MS_PER_DAY: f64 = 86_400_000.0;

/// Score one (plan blueprint, job) pair. None when the pair is ineligible.
pub fn score_job(plan: &PlanBlueprint, job: &IndustryJob, now: i64) -> Option<(f64, String)> {
    if job.activity_id != ACTIVITY_MANUFACTURING
        || job.blueprint_type_id != plan.blueprint_type_id
        || plan.runs <= 0
    {
        return None;
    }

    let runs_match =
        1.0 - ((job.runs - plan.runs).abs() as f64 / plan.runs as f64).min(1.0);
    let facility_match = match plan.facility_id {
        Some(facility_id) if facility_id == job.facility_id => 1.0,
        _ => 0.3,
    };
    let recency_match = match job.start_date {
        Some(start) => {
            let days = ((now - start).max(0)) as f64 / MS_PER_DAY;
            (-days / 7.0).exp()
        }
        None => 0.0,
    };

    let confidence = 0.5 * runs_match + 0.3 * facility_match + 0.2 * recency_match;
    let reason = format!(
        "runs {:.0}% facility {:.0}% recency {:.0}%",
        runs_match * 100.0,
        facility_match * 100.0,
        recency_match * 100.0
    );
    Some((confidence, reason))
}

/// Score every blueprint of a plan against a character's jobs and persist
/// candidates above the floor. Already-proposed pairs (including rejected
/// ones) are left alone.
pub async fn propose_job_matches(
    plans: &PlanStore,
    characters: &CharacterStore,
    plan_id: i64,
    config: &JobMatcherConfig,
) -> CoreResult<usize> {
    let plan = plans.get_plan(plan_id).await?;
    let blueprints = plans.list_blueprints(plan_id).await?;
    let jobs = characters.list_industry_jobs(plan.character_id).await?;
    let now = now_ms();

    let mut candidates = Vec::new();
    for blueprint in &blueprints {
        for job in &jobs {
            if let Some((confidence, reason)) = score_job(blueprint, job, now) {
                if confidence >= config.min_confidence {
                    candidates.push(PlanJobMatch {
                        match_id: Uuid::new_v4().to_string(),
                        plan_id,
                        plan_blueprint_id: blueprint.plan_blueprint_id,
                        job_id: job.job_id,
                        confidence,
                        reason: Some(reason),
                        status: MatchStatus::Pending,
                        confirmed_at: None,
                        confirmed_by_user: false,
                    });
                }
            }
        }
    }

    let inserted = plans.propose_job_matches(&candidates).await?;
    tracing::debug!(plan_id, candidates = candidates.len(), inserted, "job match pass");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UseIntermediates;

    fn blueprint(runs: i64, facility_id: Option<i64>) -> PlanBlueprint {
        PlanBlueprint {
            plan_blueprint_id: 1,
            plan_id: 1,
            blueprint_type_id: 1000,
            runs,
            lines: 1,
            me_level: 10,
            te_level: 20,
            facility_id,
            facility_snapshot: None,
            use_intermediates: UseIntermediates::RawMaterials,
            is_intermediate: false,
            parent_blueprint_id: None,
            intermediate_product_type_id: None,
            built_runs: 0,
            added_at: 0,
        }
    }

    fn job(blueprint_type_id: i64, runs: i64, facility_id: i64, start: i64) -> IndustryJob {
        IndustryJob {
            job_id: 1,
            character_id: 1,
            installer_id: 1,
            facility_id,
            activity_id: 1,
            blueprint_type_id,
            runs,
            status: "active".to_string(),
            start_date: Some(start),
            end_date: None,
            completed_date: None,
        }
    }

    #[test]
    fn exact_match_today_scores_full() {
        let now = now_ms();
        let (confidence, _) =
            score_job(&blueprint(10, Some(42)), &job(1000, 10, 42, now), now).unwrap();
        assert!((confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wrong_type_or_activity_is_ineligible() {
        let now = now_ms();
        assert!(score_job(&blueprint(10, None), &job(2000, 10, 42, now), now).is_none());

        let mut invention = job(1000, 10, 42, now);
        invention.activity_id = 8;
        assert!(score_job(&blueprint(10, None), &invention, now).is_none());
    }

    #[test]
    fn facility_mismatch_scores_partial() {
        let now = now_ms();
        let (confidence, _) =
            score_job(&blueprint(10, Some(42)), &job(1000, 10, 99, now), now).unwrap();
        // 0.5 + 0.3*0.3 + 0.2 = 0.79
        assert!((confidence - 0.79).abs() < 1e-9);
    }

    #[test]
    fn recency_decays_with_seven_day_half_life_shape() {
        let now = now_ms();
        let week_old = now - 7 * 86_400_000;
        let (confidence, _) =
            score_job(&blueprint(10, Some(42)), &job(1000, 10, 42, week_old), now).unwrap();
        // 0.5 + 0.3 + 0.2*e^-1
        let expected = 0.8 + 0.2 * (-1.0f64).exp();
        assert!((confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn runs_distance_saturates() {
        let now = now_ms();
        let (confidence, _) =
            score_job(&blueprint(10, Some(42)), &job(1000, 1000, 42, now), now).unwrap();
        // runs component fully lost: 0 + 0.3 + 0.2
        assert!((confidence - 0.5).abs() < 1e-9);
    }
}
