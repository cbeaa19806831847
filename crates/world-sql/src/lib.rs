//! world-sql: the durable SQL substrate for a workflow engine
//!
//! One facade, [`World`], wires the storage layer (runs, steps, events,
//! hooks), the embedded job queue and the chunk streamer over the SQL
//! back-end detected from the connection string: PostgreSQL, MySQL or
//! SQLite.
//!
//! ```ignore
//! use std::sync::Arc;
//! use world_sql::{executor_fn, World, WorldConfig};
//!
//! let executor = Arc::new(executor_fn(|queue_name, message| async move {
//!     engine.dispatch(&queue_name, message).await.map_err(|e| e.to_string())
//! }));
//!
//! let world = World::new(WorldConfig::from_env(), executor).await?;
//! world.setup().await?;
//! world.start().await?;
//!
//! let run = world.runs.create(CreateRun { /* ... */ }).await?;
//! world.queue("__wkf_workflow_w1", serde_json::json!([]), Default::default()).await?;
//! ```

pub mod auth;
pub mod config;
pub mod world;

pub use auth::{AuthProvider, StaticAuthProvider};
pub use config::WorldConfig;
pub use world::{HealthStatus, World};

// One-stop re-exports of the component crates.
pub use world_core::{
    AuthContext, CreateEvent, CreateHook, CreateRun, CreateStep, Event, Hook, ListEventsParams,
    ListParams, ListRunsParams, Page, Result, Run, RunStatus, SortOrder, Step, StepStatus,
    StreamChunk, UpdateRun, UpdateStep, WorldError,
};
pub use world_queue::{
    executor_fn, EnqueueOptions, EnqueueReceipt, Executor, JobQueue, MessageData, QueueConfig,
    RetryPolicy,
};
pub use world_storage::{DatabaseKind, DbPool, EventStore, HookStore, RunStore, StepStore};
pub use world_stream::{ChunkStream, Streamer, StreamerConfig};
