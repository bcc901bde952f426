//! The points table: requests per minute by mode and plan.

use std::collections::HashMap;
use std::time::Duration;

use crate::models::plan_key;

/// Request class a bucket covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitMode {
    Crawl,
    Scrape,
    Search,
    Map,
    Preview,
    Account,
    CrawlStatus,
    TestSuite,
}

impl RateLimitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitMode::Crawl => "crawl",
            RateLimitMode::Scrape => "scrape",
            RateLimitMode::Search => "search",
            RateLimitMode::Map => "map",
            RateLimitMode::Preview => "preview",
            RateLimitMode::Account => "account",
            RateLimitMode::CrawlStatus => "crawl-status",
            RateLimitMode::TestSuite => "test-suite",
        }
    }
}

/// One row of the table: per-plan points plus the fallback.
#[derive(Debug, Clone)]
pub struct PlanRow {
    pub default: u32,
    pub plans: HashMap<String, u32>,
}

impl PlanRow {
    fn new(default: u32, plans: &[(&str, u32)]) -> Self {
        Self {
            default,
            plans: plans
                .iter()
                .map(|(name, points)| (name.to_string(), *points))
                .collect(),
        }
    }
}

/// The full table. Lookup is `rows[mode][plan_key] ?? rows[mode].default`
/// where `plan_key` is the plan string lowercased with `-` stripped.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    rows: HashMap<RateLimitMode, PlanRow>,
    pub window: Duration,
    /// Points granted to recognized test-suite traffic.
    pub test_suite_points: u32,
    /// Points granted to the configured dev tenant.
    pub dev_team_points: u32,
    /// Points granted to manually boosted tenants.
    pub manual_team_points: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut rows = HashMap::new();
        rows.insert(
            RateLimitMode::Crawl,
            PlanRow::new(
                3,
                &[
                    ("free", 2),
                    ("starter", 10),
                    ("standard", 5),
                    ("standardnew", 10),
                    ("scale", 50),
                    ("growth", 50),
                    ("growthdouble", 50),
                    ("hobby", 3),
                ],
            ),
        );
        rows.insert(
            RateLimitMode::Scrape,
            PlanRow::new(
                20,
                &[
                    ("free", 10),
                    ("starter", 100),
                    ("standard", 100),
                    ("standardnew", 100),
                    ("scale", 500),
                    ("growth", 1000),
                    ("growthdouble", 1000),
                    ("hobby", 20),
                ],
            ),
        );
        rows.insert(
            RateLimitMode::Search,
            PlanRow::new(
                20,
                &[
                    ("free", 5),
                    ("starter", 50),
                    ("standard", 50),
                    ("standardnew", 50),
                    ("scale", 500),
                    ("growth", 500),
                    ("growthdouble", 500),
                    ("hobby", 10),
                ],
            ),
        );
        rows.insert(
            RateLimitMode::Map,
            PlanRow::new(
                20,
                &[
                    ("free", 5),
                    ("starter", 50),
                    ("standard", 50),
                    ("scale", 500),
                    ("growth", 500),
                ],
            ),
        );
        rows.insert(RateLimitMode::Preview, PlanRow::new(5, &[]));
        rows.insert(RateLimitMode::Account, PlanRow::new(100, &[]));
        rows.insert(RateLimitMode::CrawlStatus, PlanRow::new(150, &[]));
        rows.insert(RateLimitMode::TestSuite, PlanRow::new(10_000, &[]));

        Self {
            rows,
            window: Duration::from_secs(60),
            test_suite_points: 10_000,
            dev_team_points: 1_200,
            manual_team_points: 2_000,
        }
    }
}

impl RateLimitConfig {
    /// Replace a row wholesale; deployments tune the table through here.
    pub fn set_row(&mut self, mode: RateLimitMode, row: PlanRow) {
        self.rows.insert(mode, row);
    }

    /// Deterministic table lookup for a (mode, plan) pair.
    pub fn points_for(&self, mode: RateLimitMode, plan: &str) -> u32 {
        let key = plan_key(plan);
        self.rows
            .get(&mode)
            .map(|row| row.plans.get(&key).copied().unwrap_or(row.default))
            .unwrap_or(20)
    }
}
