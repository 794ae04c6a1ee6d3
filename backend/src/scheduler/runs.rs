// Scheduled-runs introspection
//
// Projects the next run time for schedule automations so UIs can show what
// will fire and when, without re-implementing the dueness rules.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use relay_shared::{ScheduleInterval, ScheduleTriggerConfig, TriggerType};
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::{parse_day_of_week, SchedulerError};
use crate::automations;

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledRun {
    pub automation_id: Uuid,
    pub name: String,
    pub interval: String,
    pub time_of_day: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_overdue: bool,
}

/// Project the next run from the last execution and the trigger config,
/// applying the time-of-day and day-of-week rules forward.
pub fn project_next_run(
    config: &ScheduleTriggerConfig,
    interval: ScheduleInterval,
    trigger_type: TriggerType,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if interval == ScheduleInterval::Once || trigger_type == TriggerType::ScheduleOnce {
        return config.run_at;
    }

    let minutes = interval.minutes()?;
    let base = match last_run {
        Some(last) => last + ChronoDuration::minutes(minutes),
        None => now,
    };

    if !matches!(interval, ScheduleInterval::Daily | ScheduleInterval::Weekly) {
        return Some(base);
    }

    let mut candidate = match &config.time_of_day {
        Some(time_of_day) => {
            let (hours, mins) = parse_hh_mm(time_of_day)?;
            let mut at_time = Utc
                .with_ymd_and_hms(base.year(), base.month(), base.day(), hours, mins, 0)
                .single()?;
            if at_time < base {
                at_time += ChronoDuration::days(1);
            }
            at_time
        }
        None => base,
    };

    if interval == ScheduleInterval::Weekly {
        if let Some(target) = config.day_of_week.as_ref().and_then(parse_day_of_week) {
            for _ in 0..7 {
                if candidate.weekday().num_days_from_sunday() == target {
                    break;
                }
                candidate += ChronoDuration::days(1);
            }
        }
    }

    Some(candidate)
}

fn parse_hh_mm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.trim().split_once(':')?;
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    (hours < 24 && minutes < 60).then_some((hours, minutes))
}

/// List projected runs for active schedule automations, optionally
/// restricted to one bucket or one owner.
pub async fn scheduled_runs(
    pool: &PgPool,
    interval: Option<&str>,
    user_id: Option<Uuid>,
    limit: usize,
) -> Result<Vec<ScheduledRun>, SchedulerError> {
    let now = Utc::now();
    let buckets: Vec<ScheduleInterval> = match interval.and_then(ScheduleInterval::parse) {
        Some(bucket) => vec![bucket],
        None => ScheduleInterval::ALL.to_vec(),
    };

    let mut runs = Vec::new();
    for bucket in buckets {
        for automation in automations::schedule_bucket(pool, bucket.as_str()).await? {
            if let Some(owner) = user_id {
                if automation.owner_id != owner {
                    continue;
                }
            }

            let config: ScheduleTriggerConfig =
                match serde_json::from_value::<ScheduleTriggerConfig>(
                    automation.trigger_config.clone(),
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(automation = %automation.id, "malformed schedule config: {e}");
                        continue;
                    }
                };

            let last_run = automations::last_scheduled_execution(pool, automation.id).await?;
            let next_run_at = project_next_run(
                &config,
                bucket,
                automation.trigger_type,
                last_run,
                now,
            );

            runs.push(ScheduledRun {
                automation_id: automation.id,
                name: automation.name,
                interval: bucket.as_str().to_string(),
                time_of_day: config.time_of_day.clone(),
                last_run_at: last_run,
                next_run_at,
                is_overdue: next_run_at.is_some_and(|next| next < now),
            });

            if runs.len() >= limit {
                return Ok(runs);
            }
        }
    }

    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn once_projects_run_at() {
        let config = ScheduleTriggerConfig {
            interval: "once".into(),
            run_at: Some(at("2025-03-01T08:00:00Z")),
            ..Default::default()
        };
        assert_eq!(
            project_next_run(
                &config,
                ScheduleInterval::Once,
                TriggerType::ScheduleOnce,
                None,
                at("2025-02-27T00:00:00Z")
            ),
            Some(at("2025-03-01T08:00:00Z"))
        );
    }

    #[test]
    fn daily_projects_to_next_slot() {
        let config = ScheduleTriggerConfig {
            interval: "daily".into(),
            time_of_day: Some("09:00".into()),
            ..Default::default()
        };
        // Ran today at 09:02; next slot is tomorrow 09:00.
        let next = project_next_run(
            &config,
            ScheduleInterval::Daily,
            TriggerType::ScheduleRecurring,
            Some(at("2025-02-27T09:02:00Z")),
            at("2025-02-27T10:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, at("2025-02-28T09:00:00Z"));
    }

    #[test]
    fn overdue_daily_is_in_the_past() {
        let config = ScheduleTriggerConfig {
            interval: "daily".into(),
            time_of_day: Some("09:00".into()),
            ..Default::default()
        };
        // Last ran two days ago; projection lands before now.
        let now = at("2025-02-27T12:00:00Z");
        let next = project_next_run(
            &config,
            ScheduleInterval::Daily,
            TriggerType::ScheduleRecurring,
            Some(at("2025-02-25T09:00:00Z")),
            now,
        )
        .unwrap();
        assert!(next < now);
    }

    #[test]
    fn weekly_advances_to_target_day() {
        let config = ScheduleTriggerConfig {
            interval: "weekly".into(),
            time_of_day: Some("10:00".into()),
            day_of_week: Some(json!("monday")),
            ..Default::default()
        };
        // No prior run, asked on a Thursday: next Monday 10:00.
        let next = project_next_run(
            &config,
            ScheduleInterval::Weekly,
            TriggerType::ScheduleRecurring,
            None,
            at("2025-02-27T12:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, at("2025-03-03T10:00:00Z"));
        assert_eq!(next.weekday().num_days_from_sunday(), 1);
    }

    #[test]
    fn hourly_projects_interval_after_last() {
        let config = ScheduleTriggerConfig {
            interval: "1hr".into(),
            ..Default::default()
        };
        let next = project_next_run(
            &config,
            ScheduleInterval::OneHour,
            TriggerType::ScheduleRecurring,
            Some(at("2025-02-27T09:00:00Z")),
            at("2025-02-27T09:30:00Z"),
        )
        .unwrap();
        assert_eq!(next, at("2025-02-27T10:00:00Z"));
    }
}
