//! Test lifecycle, counter aggregation, and winner evaluation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use dripflow_core::error::{EngineError, EngineResult};
use dripflow_queue::{JobHandler, JobKind, JobQueue, NewJob, QueueJob};

use crate::assignment::{pick_index, stable_bucket};
use crate::stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Subject,
    Content,
    SendTime,
    FromName,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriteria {
    OpenRate,
    ClickRate,
    ConversionRate,
    Revenue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Running,
    Completed,
    Inconclusive,
}

/// Definition used to start a test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestSpec {
    pub campaign_id: Uuid,
    pub test_type: TestType,
    pub winner_criteria: WinnerCriteria,
    pub auto_select_winner: bool,
    pub test_duration_hours: u32,
    /// e.g. 0.95. Significance requires `p <= 1 - confidence_level`. Must
    /// be strictly between 0 and 1; levels without a tabulated critical
    /// value get 95% interval widths, see [`stats::z_for_confidence`].
    pub confidence_level: f64,
    pub min_sample_size: u64,
    pub variants: Vec<VariantSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSpec {
    pub label: String,
    pub split_percentage: u8,
    pub template_id: String,
}

/// One arm of a running test. Counters are monotonic and only ever move
/// through atomic adds; revenue keeps sum and sum-of-squares for the
/// Welch test.
#[derive(Debug)]
pub struct Variant {
    pub id: Uuid,
    pub label: String,
    pub split_percentage: u8,
    pub template_id: String,
    sent: AtomicU64,
    opened: AtomicU64,
    clicked: AtomicU64,
    conversions: AtomicU64,
    revenue: Mutex<RevenueAccumulator>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RevenueAccumulator {
    sum: f64,
    sum_sq: f64,
}

impl Variant {
    fn from_spec(spec: &VariantSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: spec.label.clone(),
            split_percentage: spec.split_percentage,
            template_id: spec.template_id.clone(),
            sent: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            clicked: AtomicU64::new(0),
            conversions: AtomicU64::new(0),
            revenue: Mutex::new(RevenueAccumulator::default()),
        }
    }

    pub fn snapshot(&self) -> VariantStats {
        let revenue = *self.revenue.lock();
        VariantStats {
            variant_id: self.id,
            label: self.label.clone(),
            split_percentage: self.split_percentage,
            sent_count: self.sent.load(Ordering::Relaxed),
            opened_count: self.opened.load(Ordering::Relaxed),
            clicked_count: self.clicked.load(Ordering::Relaxed),
            conversion_count: self.conversions.load(Ordering::Relaxed),
            revenue: revenue.sum,
        }
    }
}

/// Point-in-time counter snapshot of a variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantStats {
    pub variant_id: Uuid,
    pub label: String,
    pub split_percentage: u8,
    pub sent_count: u64,
    pub opened_count: u64,
    pub clicked_count: u64,
    pub conversion_count: u64,
    pub revenue: f64,
}

impl VariantStats {
    fn successes(&self, criteria: WinnerCriteria) -> u64 {
        match criteria {
            WinnerCriteria::OpenRate => self.opened_count,
            WinnerCriteria::ClickRate => self.clicked_count,
            WinnerCriteria::ConversionRate => self.conversion_count,
            WinnerCriteria::Revenue => self.conversion_count,
        }
    }

    /// Rate under the winner criterion; revenue yields mean revenue per send.
    pub fn rate(&self, criteria: WinnerCriteria) -> f64 {
        if self.sent_count == 0 {
            return 0.0;
        }
        match criteria {
            WinnerCriteria::Revenue => self.revenue / self.sent_count as f64,
            _ => self.successes(criteria) as f64 / self.sent_count as f64,
        }
    }
}

/// A running or finished A/B test attached to one campaign.
#[derive(Debug)]
pub struct AbTest {
    pub campaign_id: Uuid,
    pub test_type: TestType,
    pub winner_criteria: WinnerCriteria,
    pub status: AbTestStatus,
    pub auto_select_winner: bool,
    pub test_duration_hours: u32,
    pub confidence_level: f64,
    pub min_sample_size: u64,
    pub started_at: DateTime<Utc>,
    pub winner_variant_id: Option<Uuid>,
    pub variants: Vec<Variant>,
}

impl AbTest {
    fn duration_elapsed(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at)
            >= chrono::Duration::hours(self.test_duration_hours as i64)
    }
}

/// The variant chosen for a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedVariant {
    pub variant_id: Uuid,
    pub label: String,
    pub template_id: String,
}

/// Pairwise significance verdict against the control variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Significance {
    pub criterion: WinnerCriteria,
    pub control_variant_id: Uuid,
    pub best_variant_id: Option<Uuid>,
    pub statistic: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub sample_size_met: bool,
    pub duration_elapsed: bool,
    pub can_declare_winner: bool,
}

/// Full report returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestResult {
    pub campaign_id: Uuid,
    pub status: AbTestStatus,
    pub winner_variant_id: Option<Uuid>,
    pub variants: Vec<VariantReport>,
    pub statistics: Significance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantReport {
    #[serde(flatten)]
    pub stats: VariantStats,
    pub rate: f64,
    /// Wilson score interval on the criterion rate (zero-width for revenue).
    pub confidence_interval: (f64, f64),
}

#[derive(Default)]
pub struct AbTestEngine {
    tests: DashMap<Uuid, AbTest>,
    /// Recorded assignments, keyed by (campaign, subscriber), kept for
    /// auditability; the hash alone already determines the variant.
    assignments: DashMap<(Uuid, String), Uuid>,
}

impl AbTestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a test. Split percentages must sum to exactly 100 and at
    /// least two variants are required; the variant set is immutable once
    /// the test is running.
    pub fn create_test(&self, spec: AbTestSpec) -> EngineResult<Uuid> {
        if spec.variants.len() < 2 {
            return Err(EngineError::Validation(
                "A/B test requires at least two variants".into(),
            ));
        }
        let total: u32 = spec.variants.iter().map(|v| v.split_percentage as u32).sum();
        if total != 100 {
            return Err(EngineError::Validation(format!(
                "Variant split percentages must sum to 100, got {total}"
            )));
        }
        if spec.confidence_level <= 0.0 || spec.confidence_level >= 1.0 {
            return Err(EngineError::Validation(format!(
                "Confidence level must be in (0, 1), got {}",
                spec.confidence_level
            )));
        }
        if self.tests.contains_key(&spec.campaign_id) {
            return Err(EngineError::Validation(format!(
                "Campaign {} already has a test",
                spec.campaign_id
            )));
        }

        let test = AbTest {
            campaign_id: spec.campaign_id,
            test_type: spec.test_type,
            winner_criteria: spec.winner_criteria,
            status: AbTestStatus::Running,
            auto_select_winner: spec.auto_select_winner,
            test_duration_hours: spec.test_duration_hours,
            confidence_level: spec.confidence_level,
            min_sample_size: spec.min_sample_size,
            started_at: Utc::now(),
            winner_variant_id: None,
            variants: spec.variants.iter().map(Variant::from_spec).collect(),
        };
        info!(campaign_id = %spec.campaign_id, variants = test.variants.len(), "A/B test started");
        self.tests.insert(spec.campaign_id, test);
        Ok(spec.campaign_id)
    }

    pub fn has_running_test(&self, campaign_id: &Uuid) -> bool {
        self.tests
            .get(campaign_id)
            .map(|t| t.status == AbTestStatus::Running)
            .unwrap_or(false)
    }

    /// Deterministically assigns the subscriber to a variant of the
    /// campaign's running test. Repeated calls (retries included) return
    /// the same variant.
    pub fn assign(&self, campaign_id: &Uuid, subscriber_id: &str) -> Option<AssignedVariant> {
        let test = self.tests.get(campaign_id)?;
        if test.status != AbTestStatus::Running {
            return None;
        }
        let percentages: Vec<u8> = test.variants.iter().map(|v| v.split_percentage).collect();
        let bucket = stable_bucket(&campaign_id.to_string(), subscriber_id);
        let variant = &test.variants[pick_index(bucket, &percentages)];

        self.assignments
            .entry((*campaign_id, subscriber_id.to_string()))
            .or_insert(variant.id);

        Some(AssignedVariant {
            variant_id: variant.id,
            label: variant.label.clone(),
            template_id: variant.template_id.clone(),
        })
    }

    /// The audited assignment, if one was made.
    pub fn recorded_assignment(&self, campaign_id: &Uuid, subscriber_id: &str) -> Option<Uuid> {
        self.assignments
            .get(&(*campaign_id, subscriber_id.to_string()))
            .map(|v| *v)
    }

    pub fn record_sent(&self, campaign_id: &Uuid, variant_id: &Uuid) {
        self.with_variant(campaign_id, variant_id, |v| {
            v.sent.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_opened(&self, campaign_id: &Uuid, variant_id: &Uuid) {
        self.with_variant(campaign_id, variant_id, |v| {
            v.opened.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_clicked(&self, campaign_id: &Uuid, variant_id: &Uuid) {
        self.with_variant(campaign_id, variant_id, |v| {
            v.clicked.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_conversion(&self, campaign_id: &Uuid, variant_id: &Uuid, revenue: f64) {
        self.with_variant(campaign_id, variant_id, |v| {
            v.conversions.fetch_add(1, Ordering::Relaxed);
            let mut acc = v.revenue.lock();
            acc.sum += revenue;
            acc.sum_sq += revenue * revenue;
        });
    }

    fn with_variant(&self, campaign_id: &Uuid, variant_id: &Uuid, f: impl FnOnce(&Variant)) {
        if let Some(test) = self.tests.get(campaign_id) {
            if let Some(variant) = test.variants.iter().find(|v| v.id == *variant_id) {
                f(variant);
            }
        }
    }

    /// Current report with pairwise statistics against the control.
    pub fn get_result(&self, campaign_id: &Uuid) -> EngineResult<AbTestResult> {
        let test = self
            .tests
            .get(campaign_id)
            .ok_or_else(|| EngineError::NotFound(format!("A/B test for campaign {campaign_id}")))?;
        Ok(self.evaluate_test(&test, Utc::now()))
    }

    /// Manual winner override. Marks the test completed regardless of
    /// statistical state.
    pub fn select_winner(&self, campaign_id: &Uuid, variant_id: &Uuid) -> EngineResult<()> {
        let mut test = self
            .tests
            .get_mut(campaign_id)
            .ok_or_else(|| EngineError::NotFound(format!("A/B test for campaign {campaign_id}")))?;
        if !test.variants.iter().any(|v| v.id == *variant_id) {
            return Err(EngineError::Validation(format!(
                "Variant {variant_id} does not belong to campaign {campaign_id}"
            )));
        }
        test.winner_variant_id = Some(*variant_id);
        test.status = AbTestStatus::Completed;
        info!(campaign_id = %campaign_id, variant_id = %variant_id, "Winner selected manually");
        Ok(())
    }

    /// Periodic, idempotent significance sweep over all running tests.
    /// Safe to run concurrently with counter increments. Never declares
    /// an unproven winner: a test that runs out its clock without
    /// significance becomes inconclusive.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut transitioned = 0;
        for mut entry in self.tests.iter_mut() {
            if entry.status != AbTestStatus::Running {
                continue;
            }
            let result = self.evaluate_test(&entry, now);
            if result.statistics.can_declare_winner && entry.auto_select_winner {
                entry.winner_variant_id = result.statistics.best_variant_id;
                entry.status = AbTestStatus::Completed;
                info!(
                    campaign_id = %entry.campaign_id,
                    winner = ?entry.winner_variant_id,
                    p_value = result.statistics.p_value,
                    "A/B test completed with auto-selected winner"
                );
                transitioned += 1;
            } else if result.statistics.duration_elapsed && !result.statistics.is_significant {
                entry.status = AbTestStatus::Inconclusive;
                info!(
                    campaign_id = %entry.campaign_id,
                    p_value = result.statistics.p_value,
                    "A/B test inconclusive after test window"
                );
                transitioned += 1;
            } else {
                debug!(campaign_id = %entry.campaign_id, "A/B test still open");
            }
        }
        transitioned
    }

    fn evaluate_test(&self, test: &AbTest, now: DateTime<Utc>) -> AbTestResult {
        let criteria = test.winner_criteria;
        let snapshots: Vec<VariantStats> = test.variants.iter().map(|v| v.snapshot()).collect();
        let z = stats::z_for_confidence(test.confidence_level);

        // Control is the first variant; if it recorded no sends yet, fall
        // back to the variant with the largest sample.
        let control_index = if snapshots[0].sent_count > 0 {
            0
        } else {
            snapshots
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.sent_count)
                .map(|(i, _)| i)
                .unwrap_or(0)
        };

        // Challenger with the best rate among the others.
        let best_index = snapshots
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != control_index)
            .max_by(|(_, a), (_, b)| {
                a.rate(criteria)
                    .partial_cmp(&b.rate(criteria))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i);

        let pairwise = best_index.and_then(|best| {
            let control = &snapshots[control_index];
            let challenger = &snapshots[best];
            match criteria {
                WinnerCriteria::Revenue => {
                    let (mean_c, var_c) = revenue_moments(&test.variants[control_index], control);
                    let (mean_b, var_b) = revenue_moments(&test.variants[best], challenger);
                    stats::welch_t(
                        mean_b,
                        var_b,
                        challenger.sent_count,
                        mean_c,
                        var_c,
                        control.sent_count,
                    )
                }
                _ => stats::two_proportion_z(
                    challenger.successes(criteria),
                    challenger.sent_count,
                    control.successes(criteria),
                    control.sent_count,
                ),
            }
        });

        let alpha = 1.0 - test.confidence_level;
        let (statistic, p_value) = pairwise
            .map(|t| (t.statistic, t.p_value))
            .unwrap_or((0.0, 1.0));
        let is_significant = p_value <= alpha;
        let sample_size_met = snapshots.iter().all(|s| s.sent_count >= test.min_sample_size);
        let duration_elapsed = test.duration_elapsed(now);

        // The winner is only ever the measured best challenger or the
        // control itself when the challenger is significantly worse.
        let best_variant_id = best_index.map(|best| {
            if snapshots[best].rate(criteria) >= snapshots[control_index].rate(criteria) {
                snapshots[best].variant_id
            } else {
                snapshots[control_index].variant_id
            }
        });

        let statistics = Significance {
            criterion: criteria,
            control_variant_id: snapshots[control_index].variant_id,
            best_variant_id,
            statistic,
            p_value,
            is_significant,
            sample_size_met,
            duration_elapsed,
            can_declare_winner: is_significant && sample_size_met && duration_elapsed,
        };

        let variants = snapshots
            .into_iter()
            .map(|stats_snapshot| {
                let rate = stats_snapshot.rate(criteria);
                let confidence_interval = match criteria {
                    WinnerCriteria::Revenue => (rate, rate),
                    _ => stats::wilson_interval(
                        stats_snapshot.successes(criteria),
                        stats_snapshot.sent_count,
                        z,
                    ),
                };
                VariantReport {
                    stats: stats_snapshot,
                    rate,
                    confidence_interval,
                }
            })
            .collect();

        AbTestResult {
            campaign_id: test.campaign_id,
            status: test.status,
            winner_variant_id: test.winner_variant_id,
            variants,
            statistics,
        }
    }
}

fn revenue_moments(variant: &Variant, snapshot: &VariantStats) -> (f64, f64) {
    let n = snapshot.sent_count as f64;
    if n < 2.0 {
        return (0.0, 0.0);
    }
    let acc = *variant.revenue.lock();
    // Non-converting sends contribute zero revenue, so moments are taken
    // over all sends.
    let mean = acc.sum / n;
    let var = ((acc.sum_sq - acc.sum * acc.sum / n) / (n - 1.0)).max(0.0);
    (mean, var)
}

/// Self-perpetuating queue job that runs the significance sweep.
pub struct SweepHandler {
    engine: Arc<AbTestEngine>,
    queue: Arc<dyn JobQueue>,
    interval_secs: u64,
}

impl SweepHandler {
    pub fn new(engine: Arc<AbTestEngine>, queue: Arc<dyn JobQueue>, interval_secs: u64) -> Self {
        Self {
            engine,
            queue,
            interval_secs,
        }
    }

    /// Enqueues the first sweep job.
    pub fn schedule_first(&self) -> EngineResult<()> {
        self.queue
            .enqueue(NewJob::new(JobKind::AbTestEvaluation, serde_json::json!({})))
            .map(|_| ())
    }
}

impl JobHandler for SweepHandler {
    fn kind(&self) -> JobKind {
        JobKind::AbTestEvaluation
    }

    fn handle(&self, _job: &QueueJob) -> EngineResult<()> {
        self.engine.sweep();
        self.queue.enqueue(
            NewJob::new(JobKind::AbTestEvaluation, serde_json::json!({}))
                .not_before(Utc::now() + chrono::Duration::seconds(self.interval_secs as i64)),
        )?;
        Ok(())
    }
}
