//! Wiring of the stores, services and learning loop behind one handle

use crate::config::Config;
use crate::delivery::{Delivery, DeliveryRequest, DeliveryService};
use crate::error::{DoclensError, Result};
use crate::export::{CacheExporter, CommandExporter, ExportQueue};
use crate::healing::SelfHealer;
use crate::learning::{ABController, LearningEngine, RuleStore};
use crate::storage::{CacheStore, Database, ExperimentStore, SessionLedger};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Everything a host needs, opened from one [`Config`]
pub struct Doclens {
    config: Config,
    db: Database,
    cache: CacheStore,
    ledger: SessionLedger,
    rules: RuleStore,
    controller: Arc<ABController>,
    healer: SelfHealer,
    engine: LearningEngine,
    delivery: DeliveryService,
    export_worker: Option<JoinHandle<()>>,
}

impl Doclens {
    /// Open the database (applying migrations) and build every component
    ///
    /// Must be called from within a tokio runtime when export is enabled.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let db = Database::from_config(&config.storage).await?;

        let mut cache = CacheStore::new(db.clone(), config.cache.ttl);
        let mut export_worker = None;
        if config.export.enabled {
            let exporter = CommandExporter::new(&config.export.command, config.export.timeout)
                .ok_or_else(|| DoclensError::Config("export.command is empty".to_string()))?;
            debug!(exporter = exporter.name(), "Starting cache export worker");
            let (queue, handle) = ExportQueue::spawn(Arc::new(exporter), config.export.queue_capacity);
            cache = cache.with_export(queue);
            export_worker = Some(handle);
        }

        let ledger = SessionLedger::new(
            db.clone(),
            config.ledger.grace_period,
            config.ledger.min_group_sessions,
        );
        let rules = RuleStore::new(&config.storage.rules_path);
        let controller = Arc::new(ABController::new(
            ExperimentStore::new(db.clone()),
            config.experiments.clone(),
            config.thresholds.clone(),
        ));
        let healer = SelfHealer::new(db.clone(), cache.clone(), rules.clone());
        let engine = LearningEngine::new(
            &config,
            ledger.clone(),
            controller.clone(),
            rules.clone(),
            healer.clone(),
        );
        let delivery = DeliveryService::new(
            cache.clone(),
            ledger.clone(),
            rules.clone(),
            controller.clone(),
        );

        Ok(Self {
            config,
            db,
            cache,
            ledger,
            rules,
            controller,
            healer,
            engine,
            delivery,
            export_worker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ledger
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    pub fn controller(&self) -> &ABController {
        &self.controller
    }

    pub fn healer(&self) -> &SelfHealer {
        &self.healer
    }

    pub fn engine(&self) -> &LearningEngine {
        &self.engine
    }

    pub fn delivery(&self) -> &DeliveryService {
        &self.delivery
    }

    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<Delivery> {
        self.delivery.deliver(request).await
    }

    /// Attach outcome signals to the latest delivery of a session
    pub async fn record_session_outcome(
        &self,
        session_id: &str,
        complete: Option<bool>,
        follow_up_actions: &[String],
    ) -> Result<i64> {
        let log_id = self
            .ledger
            .latest_for_session(session_id)
            .await?
            .ok_or_else(|| DoclensError::NotFound(format!("session {}", session_id)))?;
        self.ledger
            .record_outcome(log_id, complete, follow_up_actions)
            .await?;
        Ok(log_id)
    }

    /// Drop the cache's export queue and wait for queued exports to drain
    pub async fn shutdown(self) {
        let Self {
            cache,
            healer,
            delivery,
            engine,
            export_worker,
            ..
        } = self;
        drop((cache, healer, delivery, engine));

        if let Some(handle) = export_worker {
            if let Err(e) = handle.await {
                warn!("Export worker ended abnormally: {}", e);
            }
        }
    }
}
