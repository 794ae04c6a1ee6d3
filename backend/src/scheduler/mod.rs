// Schedule execution
//
// Cadence buckets (5min .. weekly, plus once) are swept on a cron driven by
// tokio-cron-scheduler. Dueness is decided per automation from its most
// recent scheduled execution and the trigger config; dispatch happens in
// small delayed batches, like every other fan-out in the engine.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use relay_shared::{AutomationRecord, ScheduleInterval, ScheduleTriggerConfig, TriggerType};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

use crate::automations;
use crate::engine::{record_execution, ExecutionInput, Executor};
use crate::events::Dispatcher;
use crate::poller::{PollOptions, PollingEngine};
use crate::users::get_user_info;

pub mod runs;

/// Dispatch fan-out width and pacing, matching the poller's.
const DISPATCH_BATCH_SIZE: usize = 5;
const DISPATCH_BATCH_DELAY_MS: u64 = 1000;

/// Finishing a batch late must not push the next day's run past its slot,
/// so the recency cutoff is relaxed by this much.
const INTERVAL_SAFETY_BUFFER_MINUTES: i64 = 10;

/// Time-of-day gates match within the current five-minute window.
const GATE_WINDOW_MINUTES: u32 = 5;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    Cron(#[from] JobSchedulerError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Recency cutoff: due when there is no prior scheduled run, or the most
/// recent one is strictly older than `now - (interval - buffer)`.
pub fn interval_elapsed(
    last_run: Option<DateTime<Utc>>,
    interval_minutes: i64,
    now: DateTime<Utc>,
) -> bool {
    match last_run {
        None => true,
        Some(last) => {
            let cutoff = now - ChronoDuration::minutes(interval_minutes - INTERVAL_SAFETY_BUFFER_MINUTES);
            last < cutoff
        }
    }
}

/// "HH:MM" (UTC) is due iff the target minute falls inside the current
/// five-minute window.
pub fn time_of_day_due(time_of_day: &str, now: DateTime<Utc>) -> bool {
    let Some((hours, minutes)) = parse_time_of_day(time_of_day) else {
        warn!(time_of_day, "unparseable time_of_day, treating as due");
        return true;
    };
    let target = hours * 60 + minutes;
    let now_minute = now.hour() * 60 + now.minute();
    let window_start = (now_minute / GATE_WINDOW_MINUTES) * GATE_WINDOW_MINUTES;
    target >= window_start && target < window_start + GATE_WINDOW_MINUTES
}

fn parse_time_of_day(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    (hours < 24 && minutes < 60).then_some((hours, minutes))
}

/// Day-of-week gate, Sunday = 0. Accepts numbers and day names.
pub fn day_of_week_due(target: &Value, now: DateTime<Utc>) -> bool {
    let today = now.weekday().num_days_from_sunday();
    match parse_day_of_week(target) {
        Some(day) => day == today,
        None => {
            warn!(?target, "unparseable day_of_week, treating as due");
            true
        }
    }
}

pub(crate) fn parse_day_of_week(target: &Value) -> Option<u32> {
    match target {
        Value::Number(n) => {
            let day = n.as_i64()?;
            (0..=6).contains(&day).then_some(day as u32)
        }
        Value::String(s) => {
            let name = s.trim().to_lowercase();
            let day = match name.as_str() {
                "sunday" | "sun" => 0,
                "monday" | "mon" => 1,
                "tuesday" | "tue" => 2,
                "wednesday" | "wed" => 3,
                "thursday" | "thu" => 4,
                "friday" | "fri" => 5,
                "saturday" | "sat" => 6,
                _ => return name.parse::<u32>().ok().filter(|d| *d <= 6),
            };
            Some(day)
        }
        _ => None,
    }
}

/// Full dueness decision for one automation in one bucket sweep.
pub fn is_due(
    config: &ScheduleTriggerConfig,
    interval: ScheduleInterval,
    trigger_type: TriggerType,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if interval == ScheduleInterval::Once || trigger_type == TriggerType::ScheduleOnce {
        return config.run_at.is_some_and(|run_at| run_at <= now);
    }

    let Some(minutes) = interval.minutes() else {
        return false;
    };
    if !interval_elapsed(last_run, minutes, now) {
        return false;
    }

    if matches!(interval, ScheduleInterval::Daily | ScheduleInterval::Weekly) {
        if let Some(time_of_day) = &config.time_of_day {
            if !time_of_day_due(time_of_day, now) {
                return false;
            }
        }
    }

    if interval == ScheduleInterval::Weekly {
        if let Some(day) = &config.day_of_week {
            if !day_of_week_due(day, now) {
                return false;
            }
        }
    }

    true
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct BucketSummary {
    pub checked: usize,
    pub dispatched: usize,
    pub failures: usize,
}

pub struct SchedulerService {
    db_pool: PgPool,
    executor: Arc<Executor>,
}

impl SchedulerService {
    pub fn new(db_pool: PgPool, executor: Arc<Executor>) -> Self {
        Self { db_pool, executor }
    }

    /// Sweep one cadence bucket: find due automations and dispatch them in
    /// paced batches.
    pub async fn run_bucket(&self, interval: ScheduleInterval) -> Result<BucketSummary, SchedulerError> {
        let now = Utc::now();
        let candidates = automations::schedule_bucket(&self.db_pool, interval.as_str()).await?;

        let mut due = Vec::new();
        for automation in candidates {
            let config: ScheduleTriggerConfig =
                serde_json::from_value(automation.trigger_config.clone()).unwrap_or_default();
            let last_run =
                automations::last_scheduled_execution(&self.db_pool, automation.id).await?;
            if is_due(&config, interval, automation.trigger_type, last_run, now) {
                due.push(automation);
            }
        }

        let mut summary = BucketSummary {
            checked: due.len(),
            ..Default::default()
        };

        for batch in due.chunks(DISPATCH_BATCH_SIZE) {
            for automation in batch {
                if self.dispatch_scheduled(automation, interval).await {
                    summary.dispatched += 1;
                } else {
                    summary.failures += 1;
                }
            }
            if batch.len() == DISPATCH_BATCH_SIZE {
                tokio::time::sleep(std::time::Duration::from_millis(DISPATCH_BATCH_DELAY_MS)).await;
            }
        }

        if summary.checked > 0 {
            info!(
                interval = interval.as_str(),
                dispatched = summary.dispatched,
                failures = summary.failures,
                "schedule bucket swept"
            );
        }
        Ok(summary)
    }

    /// Execute one due schedule. Returns true when the run was dispatched
    /// and logged; a successful dispatch deactivates one-time schedules.
    async fn dispatch_scheduled(
        &self,
        automation: &AutomationRecord,
        interval: ScheduleInterval,
    ) -> bool {
        let started_at = Utc::now();

        let user = match get_user_info(&self.db_pool, automation.owner_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(automation = %automation.id, "schedule owner has no user row, skipping");
                return false;
            }
            Err(e) => {
                error!(automation = %automation.id, "user lookup failed: {e}");
                return false;
            }
        };

        let trigger_data = json!({
            "type": "schedule",
            "interval": interval.as_str(),
            "scheduled_time": started_at.to_rfc3339(),
        });

        let input = ExecutionInput {
            automation_id: automation.id,
            automation_name: automation.name.clone(),
            owner_id: automation.owner_id,
            actions: automation.actions.clone(),
            variables: automation.variables.clone(),
            trigger_data: trigger_data.clone(),
            user,
            now: started_at,
        };

        let result = self.executor.execute(&input).await;
        info!(
            automation = %automation.id,
            status = result.status.as_str(),
            "scheduled automation executed"
        );

        if let Err(e) = record_execution(
            &self.db_pool,
            automation.id,
            automation.owner_id,
            automation.trigger_type.as_str(),
            &trigger_data,
            started_at,
            &result,
        )
        .await
        {
            error!(automation = %automation.id, "failed to record execution log: {e}");
            return false;
        }

        if automation.trigger_type == TriggerType::ScheduleOnce && result.success {
            if let Err(e) = automations::deactivate(&self.db_pool, automation.id).await {
                error!(automation = %automation.id, "failed to deactivate one-time schedule: {e}");
            }
        }

        true
    }
}

/// Register all background jobs: bucket sweeps, the poll tick and the queue
/// sweep. Daily/weekly/once buckets are checked every five minutes because
/// their dueness gates work in five-minute windows.
pub async fn start_background_jobs(
    scheduler: Arc<SchedulerService>,
    poller: Arc<PollingEngine>,
    dispatcher: Arc<Dispatcher>,
) -> Result<JobScheduler, SchedulerError> {
    let cron = JobScheduler::new().await?;

    let fine_grained: &[(ScheduleInterval, &str)] = &[
        (ScheduleInterval::FiveMin, "0 */5 * * * *"),
        (ScheduleInterval::Daily, "0 */5 * * * *"),
        (ScheduleInterval::Weekly, "0 */5 * * * *"),
        (ScheduleInterval::Once, "0 */5 * * * *"),
        (ScheduleInterval::FifteenMin, "0 */15 * * * *"),
        (ScheduleInterval::ThirtyMin, "0 */30 * * * *"),
        (ScheduleInterval::OneHour, "0 0 * * * *"),
        (ScheduleInterval::SixHours, "0 0 */6 * * *"),
    ];

    for (interval, cron_expr) in fine_grained {
        let service = Arc::clone(&scheduler);
        let interval = *interval;
        let job = Job::new_async(*cron_expr, move |_uuid, _lock| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                if let Err(e) = service.run_bucket(interval).await {
                    error!(interval = interval.as_str(), "bucket sweep failed: {e}");
                }
            })
        })?;
        cron.add(job).await?;
    }

    let poll_engine = Arc::clone(&poller);
    let poll_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let poll_engine = Arc::clone(&poll_engine);
        Box::pin(async move {
            if let Err(e) = poll_engine.run(&PollOptions::default()).await {
                error!("poll tick failed: {e}");
            }
        })
    })?;
    cron.add(poll_job).await?;

    // Sweep the queue for events whose post-enqueue kick was lost.
    let sweep_dispatcher = Arc::clone(&dispatcher);
    let sweep_job = Job::new_async("30 * * * * *", move |_uuid, _lock| {
        let sweep_dispatcher = Arc::clone(&sweep_dispatcher);
        Box::pin(async move {
            if let Err(e) = sweep_dispatcher.dispatch_pending().await {
                error!("queue sweep failed: {e}");
            }
        })
    })?;
    cron.add(sweep_job).await?;

    cron.start().await?;
    info!("background jobs started");
    Ok(cron)
}
