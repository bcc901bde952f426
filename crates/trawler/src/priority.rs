//! Job priority: plan tier shaped by the tenant's concurrent load.
//!
//! Lower numbers are served first. System work always wins; paid tiers
//! start ahead of free and degrade more slowly as their concurrent job
//! count grows. A store hiccup falls back to the caller's base priority
//! rather than blocking admission.

use crate::models::{plan_key, SYSTEM_TEAM_ID};
use crate::store::StateStore;

/// Default priority when neither plan band nor store count applies.
pub const BASE_PRIORITY: i32 = 10;

/// Compute the priority for a new job.
pub async fn job_priority(
    store: &dyn StateStore,
    plan: &str,
    team_id: Option<&str>,
    base_priority: i32,
) -> i32 {
    let team_id = team_id.unwrap_or(SYSTEM_TEAM_ID);
    if team_id == SYSTEM_TEAM_ID {
        return 1;
    }
    match store.team_job_count(team_id).await {
        Ok(job_count) => banded_priority(plan, job_count, base_priority),
        Err(e) => {
            tracing::warn!(team_id, error = %e, "priority count unavailable, using base");
            base_priority
        }
    }
}

/// The per-plan bands. For a fixed plan the number never decreases as the
/// active-job count rises.
fn banded_priority(plan: &str, job_count: u64, base_priority: i32) -> i32 {
    match plan_key(plan).as_str() {
        "free" => match job_count {
            c if c > 10 => 15,
            c if c > 5 => 12,
            _ => 10,
        },
        "starter" | "hobby" => match job_count {
            c if c > 20 => 12,
            c if c > 10 => 10,
            _ => 8,
        },
        "standard" | "standardnew" => match job_count {
            c if c > 30 => 8,
            c if c > 15 => 6,
            _ => 5,
        },
        "scale" | "growth" | "growthdouble" => match job_count {
            c if c > 50 => 5,
            c if c > 25 => 3,
            _ => 2,
        },
        _ => base_priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    #[tokio::test]
    async fn system_tenant_is_always_first() {
        let store = MemoryStateStore::new();
        assert_eq!(job_priority(&store, "free", None, BASE_PRIORITY).await, 1);
        assert_eq!(
            job_priority(&store, "scale", Some(SYSTEM_TEAM_ID), BASE_PRIORITY).await,
            1
        );
    }

    #[tokio::test]
    async fn standard_plan_bands_under_load() {
        let store = MemoryStateStore::new();
        for i in 0..20 {
            store.add_team_job("t1", &format!("j{i}")).await.unwrap();
        }
        assert_eq!(job_priority(&store, "standard", Some("t1"), BASE_PRIORITY).await, 6);

        for i in 20..31 {
            store.add_team_job("t1", &format!("j{i}")).await.unwrap();
        }
        assert_eq!(job_priority(&store, "standard", Some("t1"), BASE_PRIORITY).await, 8);
    }

    #[test]
    fn priority_is_monotonic_in_job_count() {
        for plan in ["free", "starter", "standard", "scale", "unknown-plan"] {
            let mut last = 0;
            for count in 0..80 {
                let priority = banded_priority(plan, count, BASE_PRIORITY);
                assert!(
                    priority >= last,
                    "plan {plan} at count {count}: {priority} < {last}"
                );
                last = priority;
            }
        }
    }

    #[test]
    fn plan_aliases_share_bands() {
        assert_eq!(banded_priority("standard-new", 0, BASE_PRIORITY), 5);
        assert_eq!(banded_priority("growth-double", 0, BASE_PRIORITY), 2);
        assert_eq!(banded_priority("hobby", 0, BASE_PRIORITY), 8);
    }

    #[test]
    fn unknown_plan_uses_base() {
        assert_eq!(banded_priority("enterprise", 0, 7), 7);
    }
}
