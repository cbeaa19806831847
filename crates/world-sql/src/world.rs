//! The World facade
//!
//! Detects the back-end, opens the pool and assembles the component set
//! for it once; afterwards every call goes through monomorphic trait
//! objects. `start` is idempotent and `stop` lets in-flight queue handlers
//! finish before the pool closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use world_core::{AuthContext, CreateHook, Hook, ListRunsParams, Result};
use world_queue::{
    EnqueueOptions, EnqueueReceipt, Executor, JobQueue, NotifyQueue, PollingQueue, QueueConfig,
};
use world_storage::{
    schema, DatabaseKind, DbPool, EventStore, HookStore, MySqlStorage, PostgresStorage,
    RunStore, SqliteStorage, StepStore,
};
use world_stream::{PgStreamer, PollingStreamer, Streamer, StreamerConfig};

use crate::auth::{AuthProvider, StaticAuthProvider};
use crate::config::WorldConfig;

/// Aggregate health payload
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// The adapter's `SELECT 1` probe
    pub database: bool,
    /// A trivial one-row listing through the storage layer
    pub storage: bool,
    pub auth: AuthContext,
}

/// Facade over storage, queue and streamer for one database
pub struct World {
    config: WorldConfig,
    db: DbPool,
    pub runs: Arc<dyn RunStore>,
    pub steps: Arc<dyn StepStore>,
    pub events: Arc<dyn EventStore>,
    pub hooks: Arc<dyn HookStore>,
    pub streamer: Arc<dyn Streamer>,
    queue: Arc<dyn JobQueue>,
    auth: Arc<dyn AuthProvider>,
    started: AtomicBool,
}

impl World {
    /// Open the pool and assemble the component set for the configured
    /// back-end, with default queue/streamer tuning derived from `config`
    pub async fn new(config: WorldConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let queue_config = QueueConfig::new()
            .with_job_prefix(config.job_prefix.clone())
            .with_worker_concurrency(config.worker_concurrency);
        Self::with_tuning(config, queue_config, StreamerConfig::default(), executor).await
    }

    /// Resolve the configuration from the environment first
    pub async fn from_env(executor: Arc<dyn Executor>) -> Result<Self> {
        Self::new(WorldConfig::from_env(), executor).await
    }

    /// Like [`World::new`] but with explicit queue and streamer tuning
    /// (shrunk intervals for tests, mostly)
    pub async fn with_tuning(
        config: WorldConfig,
        queue_config: QueueConfig,
        streamer_config: StreamerConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let kind = config.resolved_kind();
        let db = DbPool::connect(kind, &config.connection_string).await?;

        let (runs, steps, events, hooks, streamer, queue): (
            Arc<dyn RunStore>,
            Arc<dyn StepStore>,
            Arc<dyn EventStore>,
            Arc<dyn HookStore>,
            Arc<dyn Streamer>,
            Arc<dyn JobQueue>,
        ) = match &db {
            DbPool::Postgres(pool) => {
                let storage = Arc::new(PostgresStorage::new(pool.clone()));
                (
                    storage.clone(),
                    storage.clone(),
                    storage.clone(),
                    storage,
                    Arc::new(PgStreamer::new(pool.clone())),
                    Arc::new(NotifyQueue::new(pool.clone(), queue_config, executor)),
                )
            }
            DbPool::MySql(pool) => {
                let storage = Arc::new(MySqlStorage::new(pool.clone()));
                (
                    storage.clone(),
                    storage.clone(),
                    storage.clone(),
                    storage,
                    Arc::new(PollingStreamer::mysql(pool.clone(), streamer_config)),
                    Arc::new(PollingQueue::mysql(pool.clone(), queue_config, executor)),
                )
            }
            DbPool::Sqlite(pool) => {
                let storage = Arc::new(SqliteStorage::new(pool.clone()));
                (
                    storage.clone(),
                    storage.clone(),
                    storage.clone(),
                    storage,
                    Arc::new(PollingStreamer::sqlite(pool.clone(), streamer_config)),
                    Arc::new(PollingQueue::sqlite(pool.clone(), queue_config, executor)),
                )
            }
        };

        let auth = Arc::new(StaticAuthProvider::new(config.auth.clone()));

        Ok(Self {
            config,
            db,
            runs,
            steps,
            events,
            hooks,
            streamer,
            queue,
            auth,
            started: AtomicBool::new(false),
        })
    }

    /// Apply the fixed schema; idempotent
    pub async fn setup(&self) -> Result<()> {
        schema::setup(&self.db).await
    }

    /// Validate the connection and begin the queue workers. Idempotent
    /// after the first success.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.db.ping().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        if let Err(e) = self.queue.start().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(kind = %self.db.kind(), "world started");
        Ok(())
    }

    /// Stop the queue (in-flight handlers finish) and close the pool
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.queue.stop().await;
        self.db.close().await;
        self.started.store(false, Ordering::SeqCst);
        info!("world stopped");
    }

    /// Enqueue a message onto a caller-side queue name
    pub async fn queue(
        &self,
        queue_name: &str,
        message: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueReceipt> {
        self.queue.enqueue(queue_name, message, options).await
    }

    /// Register a hook for a run, stamped with the resolved tenant identity
    pub async fn register_hook(
        &self,
        run_id: impl Into<String>,
        token: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Hook> {
        let context = self.auth.resolve().await;
        self.hooks
            .create(CreateHook {
                hook_id: None,
                run_id: run_id.into(),
                token: token.into(),
                owner_id: context.owner_id,
                project_id: context.project_id,
                environment: context.environment,
                metadata,
            })
            .await
    }

    /// Aggregate health: adapter probe plus a one-row listing
    pub async fn health(&self) -> HealthStatus {
        let database = self.db.is_healthy().await;
        let storage = self
            .runs
            .list(ListRunsParams {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .is_ok();

        HealthStatus {
            healthy: database && storage,
            database,
            storage,
            auth: self.auth.resolve().await,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn database_kind(&self) -> DatabaseKind {
        self.db.kind()
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }
}
