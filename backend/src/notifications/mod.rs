// Notification delivery seam
//
// The executor and poller report noteworthy conditions (usage limits,
// failed automations) through this trait. Delivery is a collaborator
// concern; the default implementation sends email over SMTP.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::users::get_user_info;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A tool reported the usage-limit sentinel mid-run.
    async fn usage_limit_exceeded(&self, owner_id: Uuid, automation_id: Uuid, automation_name: &str);

    /// Every attempted action of a run failed.
    async fn automation_failed(
        &self,
        owner_id: Uuid,
        automation_id: Uuid,
        automation_name: &str,
        error_summary: Option<&str>,
    );

    async fn custom(&self, owner_id: Uuid, title: &str, body: &str);
}

/// SMTP-backed notifier. Failures are logged and swallowed; notification
/// delivery must never fail an automation run.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    db_pool: PgPool,
}

impl EmailNotifier {
    pub fn new(smtp_config: &SmtpConfig, db_pool: PgPool) -> Self {
        let creds = Credentials::new(smtp_config.username.clone(), smtp_config.password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            db_pool,
        }
    }

    async fn send_to_owner(&self, owner_id: Uuid, subject: &str, body: &str) {
        let user = match get_user_info(&self.db_pool, owner_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(%owner_id, "cannot notify: user not found");
                return;
            }
            Err(e) => {
                error!(%owner_id, "cannot notify: user lookup failed: {e}");
                return;
            }
        };

        let from = match format!("{} <{}>", self.from_name, self.from_email).parse::<Mailbox>() {
            Ok(m) => m,
            Err(e) => {
                error!("invalid notifier from address: {e}");
                return;
            }
        };
        let to = match user.email.parse::<Mailbox>() {
            Ok(m) => m,
            Err(e) => {
                error!(%owner_id, "invalid recipient address: {e}");
                return;
            }
        };

        let message = match Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
        {
            Ok(m) => m,
            Err(e) => {
                error!("failed to build notification message: {e}");
                return;
            }
        };

        match self.transport.send(message).await {
            Ok(_) => info!(%owner_id, subject, "notification sent"),
            Err(e) => error!(%owner_id, "failed to send notification: {e}"),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn usage_limit_exceeded(&self, owner_id: Uuid, automation_id: Uuid, automation_name: &str) {
        let body = format!(
            "Your automation \"{automation_name}\" was stopped because a service \
             usage limit was reached. Remaining actions were not run. The \
             automation will try again on its next trigger.\n\n\
             Automation id: {automation_id}"
        );
        self.send_to_owner(owner_id, "Automation paused: usage limit reached", &body)
            .await;
    }

    async fn automation_failed(
        &self,
        owner_id: Uuid,
        automation_id: Uuid,
        automation_name: &str,
        error_summary: Option<&str>,
    ) {
        let body = format!(
            "Your automation \"{automation_name}\" failed to complete.\n\n{}\n\n\
             Automation id: {automation_id}",
            error_summary.unwrap_or("No error details were recorded.")
        );
        self.send_to_owner(owner_id, "Automation failed", &body).await;
    }

    async fn custom(&self, owner_id: Uuid, title: &str, body: &str) {
        self.send_to_owner(owner_id, title, body).await;
    }
}

/// Notifier that only logs. Used in tests and when SMTP is not configured.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn usage_limit_exceeded(&self, owner_id: Uuid, automation_id: Uuid, automation_name: &str) {
        warn!(%owner_id, %automation_id, automation_name, "usage limit exceeded");
    }

    async fn automation_failed(
        &self,
        owner_id: Uuid,
        automation_id: Uuid,
        automation_name: &str,
        error_summary: Option<&str>,
    ) {
        warn!(
            %owner_id, %automation_id, automation_name,
            error = error_summary.unwrap_or(""),
            "automation failed"
        );
    }

    async fn custom(&self, owner_id: Uuid, title: &str, _body: &str) {
        info!(%owner_id, title, "notification");
    }
}
