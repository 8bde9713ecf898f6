//! Service wiring shared by the binary and the integration tests.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::AppConfig;
use crate::database::repositories::{
    MessageLogRepository, NotificationRepository, SqlxMessageLogRepository,
    SqlxNotificationRepository, SqlxTemplateRepository,
};
use crate::database::{DbPool, MaintenanceConfig, MaintenanceScheduler};
use crate::metrics::AlertMetrics;
use crate::notification::channels::{EmailSender, RealtimeSender, SmsSender};
use crate::notification::{
    ChannelSet, DeliveryExecutor, DispatchConfig, HttpProfileDirectory, NotificationDispatcher,
    NotificationQueryService, ProfileDirectory, RetryScheduler, RetrySchedulerConfig,
    TemplateService,
};

/// Settings needed to assemble the services, minus transport details.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub dispatch: DispatchConfig,
    pub retry: RetrySchedulerConfig,
    pub maintenance: MaintenanceConfig,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dispatch: config.dispatch.clone(),
            retry: config.retry.clone(),
            maintenance: config.maintenance.clone(),
        }
    }
}

/// Every long-lived service of the pipeline.
pub struct AlertRelay {
    pub dispatcher: Arc<NotificationDispatcher>,
    pub queries: Arc<NotificationQueryService>,
    pub retry: Arc<RetryScheduler>,
    pub maintenance: Arc<MaintenanceScheduler>,
    pub templates: Arc<TemplateService>,
}

impl AlertRelay {
    /// Assemble the pipeline around the given collaborators.
    pub fn new(
        pool: DbPool,
        directory: Arc<dyn ProfileDirectory>,
        channels: ChannelSet,
        metrics: Arc<dyn AlertMetrics>,
        config: PipelineConfig,
    ) -> Self {
        let notifications: Arc<dyn NotificationRepository> =
            Arc::new(SqlxNotificationRepository::new(pool.clone()));
        let message_logs: Arc<dyn MessageLogRepository> = Arc::new(
            SqlxMessageLogRepository::new(pool.clone(), config.retry.policy.max_retries),
        );
        let templates = Arc::new(TemplateService::new(Arc::new(SqlxTemplateRepository::new(
            pool,
        ))));
        let delivery = Arc::new(DeliveryExecutor::new(
            channels,
            metrics.clone(),
            config.dispatch.send_timeout(),
        ));

        let dispatcher = Arc::new(NotificationDispatcher::new(
            notifications.clone(),
            message_logs.clone(),
            directory,
            templates.clone(),
            delivery.clone(),
            metrics.clone(),
            config.dispatch,
        ));
        let retry = Arc::new(RetryScheduler::new(
            message_logs.clone(),
            delivery,
            metrics,
            config.retry,
        ));
        let queries = Arc::new(NotificationQueryService::new(
            notifications.clone(),
            message_logs.clone(),
            retry.clone(),
        ));
        let maintenance = Arc::new(MaintenanceScheduler::new(
            notifications,
            message_logs,
            config.maintenance,
        ));

        Self {
            dispatcher,
            queries,
            retry,
            maintenance,
            templates,
        }
    }

    /// Build the real transports and profile client from `config`.
    pub fn from_config(
        config: &AppConfig,
        pool: DbPool,
        metrics: Arc<dyn AlertMetrics>,
    ) -> Result<Self> {
        let mut channels = ChannelSet::new();
        if let Some(email) = &config.email {
            channels = channels.with(Arc::new(EmailSender::new(email.clone())?));
        }
        if let Some(sms) = &config.sms {
            channels = channels.with(Arc::new(SmsSender::new(sms.clone())?));
        }
        if let Some(realtime) = &config.realtime {
            channels = channels.with(Arc::new(RealtimeSender::new(realtime.clone())?));
        }
        info!(channels = ?channels.configured(), "Delivery channels configured");

        let directory = Arc::new(HttpProfileDirectory::new(config.profile_service.clone())?);
        Ok(Self::new(
            pool,
            directory,
            channels,
            metrics,
            PipelineConfig::from(config),
        ))
    }

    /// Seed templates and start the background loops.
    pub async fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        self.templates.ensure_defaults().await?;
        Ok(vec![
            self.retry.clone().start(cancel.clone()),
            self.maintenance.clone().start(cancel),
        ])
    }
}
