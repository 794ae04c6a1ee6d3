// Event dispatcher
//
// Claims queued events and resolves each to the owner's matching webhook
// automations: service already matched at ingress, so what remains is the
// event-type match and the automation's own trigger filter. Every match
// becomes one executor run with one execution-log row.

use chrono::Utc;
use relay_shared::{Event, PollingTriggerConfig, UserInfo, WebhookTriggerConfig};
use serde_json::Value;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::automations;
use crate::engine::{evaluate_filter, record_execution, BuiltinVars, ExecutionInput, Executor};
use crate::events::queue;
use crate::users::get_user_info;

const CLAIM_BATCH_SIZE: i64 = 20;

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub events_claimed: usize,
    pub executions: usize,
}

pub struct Dispatcher {
    db_pool: PgPool,
    executor: Arc<Executor>,
}

impl Dispatcher {
    pub fn new(db_pool: PgPool, executor: Arc<Executor>) -> Self {
        Self { db_pool, executor }
    }

    /// Fire-and-forget drain, used by webhook ingress so the HTTP response
    /// never blocks on downstream work.
    pub fn kick(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch_pending().await {
                error!("event dispatch failed: {e}");
            }
        });
    }

    /// Drain the queue until no claimable events remain.
    pub async fn dispatch_pending(&self) -> Result<DispatchStats, sqlx::Error> {
        let mut stats = DispatchStats::default();

        loop {
            let batch = queue::claim_batch(&self.db_pool, CLAIM_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            stats.events_claimed += batch.len();

            for event in batch {
                match self.dispatch_event(&event).await {
                    Ok(runs) => stats.executions += runs,
                    Err(e) => {
                        warn!(event_id = %event.event_id, "dispatch failed, releasing for retry: {e}");
                        queue::release_for_retry(&self.db_pool, event.id).await?;
                    }
                }
            }
        }

        if stats.events_claimed > 0 {
            info!(
                events = stats.events_claimed,
                executions = stats.executions,
                "event dispatch complete"
            );
        }
        Ok(stats)
    }

    async fn dispatch_event(&self, event: &Event) -> Result<usize, sqlx::Error> {
        let Some(user) = get_user_info(&self.db_pool, event.owner_id).await? else {
            warn!(owner_id = %event.owner_id, "event owner has no user row, dropping");
            return Ok(0);
        };

        // Poll-produced events carry their automation id in the payload and
        // route straight back to it.
        if let Some(automation_id) = event
            .event_data
            .get("automation_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return self.run_directly(event, automation_id, &user).await;
        }

        let candidates =
            automations::webhook_automations(&self.db_pool, event.owner_id, &event.service).await?;
        if candidates.is_empty() {
            // Array-shaped poll payloads cannot carry an automation id;
            // fall back to matching the owner's polling automations on
            // service and event type.
            return self.run_polling_matches(event, &user).await;
        }

        let builtins = BuiltinVars::compute(Utc::now(), user.timezone.as_deref());
        let mut runs = 0;

        for automation in candidates {
            let config: WebhookTriggerConfig =
                serde_json::from_value(automation.trigger_config.clone()).unwrap_or_default();

            if !config.matches_event_type(&event.event_type) {
                continue;
            }
            let filter = config.effective_filter();
            if !evaluate_filter(filter.as_ref(), &event.event_data, &builtins) {
                continue;
            }

            self.execute_automation(&automation, event, &user).await;
            runs += 1;
        }

        Ok(runs)
    }

    /// Dispatch an event straight to the automation named in its payload.
    async fn run_directly(
        &self,
        event: &Event,
        automation_id: Uuid,
        user: &UserInfo,
    ) -> Result<usize, sqlx::Error> {
        match automations::get(&self.db_pool, automation_id).await? {
            Some(automation) if automation.active && automation.owner_id == event.owner_id => {
                self.execute_automation(&automation, event, user).await;
                Ok(1)
            }
            _ => {
                warn!(
                    automation = %automation_id,
                    "poll event targets a missing or inactive automation, dropping"
                );
                Ok(0)
            }
        }
    }

    /// Fallback routing for poll events whose payload shape could not carry
    /// an automation id: match the owner's polling automations on service
    /// and event type.
    async fn run_polling_matches(
        &self,
        event: &Event,
        user: &UserInfo,
    ) -> Result<usize, sqlx::Error> {
        let candidates =
            automations::polling_automations(&self.db_pool, event.owner_id, &event.service).await?;
        let mut runs = 0;

        for automation in candidates {
            let config: PollingTriggerConfig =
                serde_json::from_value(automation.trigger_config.clone()).unwrap_or_default();
            let type_matches = config
                .event_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case(&event.event_type))
                .unwrap_or(true);
            if !type_matches {
                continue;
            }

            self.execute_automation(&automation, event, user).await;
            runs += 1;
        }

        Ok(runs)
    }

    async fn execute_automation(
        &self,
        automation: &relay_shared::AutomationRecord,
        event: &Event,
        user: &UserInfo,
    ) {
        let started_at = Utc::now();
        let input = ExecutionInput {
            automation_id: automation.id,
            automation_name: automation.name.clone(),
            owner_id: automation.owner_id,
            actions: automation.actions.clone(),
            variables: automation.variables.clone(),
            trigger_data: event.event_data.clone(),
            user: user.clone(),
            now: started_at,
        };

        let result = self.executor.execute(&input).await;
        info!(
            automation = %automation.id,
            status = result.status.as_str(),
            "automation executed from event"
        );

        if let Err(e) = record_execution(
            &self.db_pool,
            automation.id,
            automation.owner_id,
            automation.trigger_type.as_str(),
            &event.event_data,
            started_at,
            &result,
        )
        .await
        {
            error!(automation = %automation.id, "failed to record execution log: {e}");
        }
    }
}
