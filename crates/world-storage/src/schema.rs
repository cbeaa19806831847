//! Fixed schema for the six substrate tables
//!
//! Semantics are identical across back-ends; only column types differ
//! (JSONB/JSON/TEXT, BYTEA/LONGBLOB/BLOB, TIMESTAMPTZ/DATETIME/TEXT).
//! `setup` is idempotent and safe to run on every start.

use world_core::Result;

use crate::adapter::DbPool;

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_runs (
        run_id            VARCHAR(255) PRIMARY KEY,
        deployment_id     VARCHAR(255) NOT NULL,
        workflow_name     VARCHAR(255) NOT NULL,
        status            VARCHAR(32)  NOT NULL,
        input             JSONB        NOT NULL,
        output            JSONB,
        execution_context JSONB,
        error             TEXT,
        error_code        VARCHAR(255),
        created_at        TIMESTAMPTZ  NOT NULL,
        updated_at        TIMESTAMPTZ  NOT NULL,
        started_at        TIMESTAMPTZ,
        completed_at      TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_workflow_name ON workflow_runs (workflow_name)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs (status)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_steps (
        step_id      VARCHAR(255) PRIMARY KEY,
        run_id       VARCHAR(255) NOT NULL,
        step_name    VARCHAR(255) NOT NULL,
        status       VARCHAR(32)  NOT NULL,
        input        JSONB        NOT NULL,
        output       JSONB,
        error        TEXT,
        error_code   VARCHAR(255),
        attempt      INTEGER      NOT NULL DEFAULT 1,
        started_at   TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        created_at   TIMESTAMPTZ  NOT NULL,
        updated_at   TIMESTAMPTZ  NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_steps_run_id ON workflow_steps (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_events (
        event_id       VARCHAR(255) PRIMARY KEY,
        run_id         VARCHAR(255) NOT NULL,
        event_type     VARCHAR(255) NOT NULL,
        correlation_id VARCHAR(255),
        event_data     JSONB        NOT NULL,
        created_at     TIMESTAMPTZ  NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_events_run_id ON workflow_events (run_id)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_events_correlation_id ON workflow_events (correlation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_hooks (
        hook_id     VARCHAR(255) PRIMARY KEY,
        run_id      VARCHAR(255) NOT NULL,
        token       VARCHAR(255) NOT NULL,
        owner_id    VARCHAR(255) NOT NULL,
        project_id  VARCHAR(255) NOT NULL,
        environment VARCHAR(255) NOT NULL,
        metadata    JSONB        NOT NULL,
        created_at  TIMESTAMPTZ  NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_hooks_token ON workflow_hooks (token)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_hooks_run_id ON workflow_hooks (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_stream_chunks (
        stream_id  VARCHAR(255) NOT NULL,
        chunk_id   VARCHAR(255) NOT NULL,
        chunk_data BYTEA        NOT NULL,
        eof        BOOLEAN      NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ  NOT NULL,
        PRIMARY KEY (stream_id, chunk_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_jobs (
        id              VARCHAR(255) PRIMARY KEY,
        queue_name      VARCHAR(255) NOT NULL,
        payload         JSONB        NOT NULL,
        status          VARCHAR(32)  NOT NULL,
        attempts        INTEGER      NOT NULL DEFAULT 0,
        max_attempts    INTEGER      NOT NULL DEFAULT 3,
        locked_until    TIMESTAMPTZ,
        scheduled_for   TIMESTAMPTZ  NOT NULL,
        idempotency_key VARCHAR(255),
        error           TEXT,
        created_at      TIMESTAMPTZ  NOT NULL,
        updated_at      TIMESTAMPTZ  NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_jobs_poll ON workflow_jobs (queue_name, status, scheduled_for)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_jobs_idempotency_key ON workflow_jobs (idempotency_key)",
];

// MySQL cannot CREATE INDEX IF NOT EXISTS, so secondary indexes are declared
// inline with the tables.
const MYSQL_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_runs (
        run_id            VARCHAR(255) PRIMARY KEY,
        deployment_id     VARCHAR(255) NOT NULL,
        workflow_name     VARCHAR(255) NOT NULL,
        status            VARCHAR(32)  NOT NULL,
        input             JSON         NOT NULL,
        output            JSON,
        execution_context JSON,
        error             TEXT,
        error_code        VARCHAR(255),
        created_at        DATETIME(6)  NOT NULL,
        updated_at        DATETIME(6)  NOT NULL,
        started_at        DATETIME(6),
        completed_at      DATETIME(6),
        INDEX idx_workflow_runs_workflow_name (workflow_name),
        INDEX idx_workflow_runs_status (status)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_steps (
        step_id      VARCHAR(255) PRIMARY KEY,
        run_id       VARCHAR(255) NOT NULL,
        step_name    VARCHAR(255) NOT NULL,
        status       VARCHAR(32)  NOT NULL,
        input        JSON         NOT NULL,
        output       JSON,
        error        TEXT,
        error_code   VARCHAR(255),
        attempt      INT          NOT NULL DEFAULT 1,
        started_at   DATETIME(6),
        completed_at DATETIME(6),
        created_at   DATETIME(6)  NOT NULL,
        updated_at   DATETIME(6)  NOT NULL,
        INDEX idx_workflow_steps_run_id (run_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_events (
        event_id       VARCHAR(255) PRIMARY KEY,
        run_id         VARCHAR(255) NOT NULL,
        event_type     VARCHAR(255) NOT NULL,
        correlation_id VARCHAR(255),
        event_data     JSON         NOT NULL,
        created_at     DATETIME(6)  NOT NULL,
        INDEX idx_workflow_events_run_id (run_id),
        INDEX idx_workflow_events_correlation_id (correlation_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_hooks (
        hook_id     VARCHAR(255) PRIMARY KEY,
        run_id      VARCHAR(255) NOT NULL,
        token       VARCHAR(255) NOT NULL,
        owner_id    VARCHAR(255) NOT NULL,
        project_id  VARCHAR(255) NOT NULL,
        environment VARCHAR(255) NOT NULL,
        metadata    JSON         NOT NULL,
        created_at  DATETIME(6)  NOT NULL,
        INDEX idx_workflow_hooks_token (token),
        INDEX idx_workflow_hooks_run_id (run_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_stream_chunks (
        stream_id  VARCHAR(255) NOT NULL,
        chunk_id   VARCHAR(255) NOT NULL,
        chunk_data LONGBLOB     NOT NULL,
        eof        TINYINT(1)   NOT NULL DEFAULT 0,
        created_at DATETIME(6)  NOT NULL,
        PRIMARY KEY (stream_id, chunk_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_jobs (
        id              VARCHAR(255) PRIMARY KEY,
        queue_name      VARCHAR(255) NOT NULL,
        payload         JSON         NOT NULL,
        status          VARCHAR(32)  NOT NULL,
        attempts        INT          NOT NULL DEFAULT 0,
        max_attempts    INT          NOT NULL DEFAULT 3,
        locked_until    DATETIME(6),
        scheduled_for   DATETIME(6)  NOT NULL,
        idempotency_key VARCHAR(255),
        error           TEXT,
        created_at      DATETIME(6)  NOT NULL,
        updated_at      DATETIME(6)  NOT NULL,
        INDEX idx_workflow_jobs_poll (queue_name, status, scheduled_for),
        UNIQUE INDEX idx_workflow_jobs_idempotency_key (idempotency_key)
    )
    "#,
];

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_runs (
        run_id            TEXT PRIMARY KEY,
        deployment_id     TEXT NOT NULL,
        workflow_name     TEXT NOT NULL,
        status            TEXT NOT NULL,
        input             TEXT NOT NULL,
        output            TEXT,
        execution_context TEXT,
        error             TEXT,
        error_code        TEXT,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL,
        started_at        TEXT,
        completed_at      TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_workflow_name ON workflow_runs (workflow_name)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs (status)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_steps (
        step_id      TEXT PRIMARY KEY,
        run_id       TEXT NOT NULL,
        step_name    TEXT NOT NULL,
        status       TEXT NOT NULL,
        input        TEXT NOT NULL,
        output       TEXT,
        error        TEXT,
        error_code   TEXT,
        attempt      INTEGER NOT NULL DEFAULT 1,
        started_at   TEXT,
        completed_at TEXT,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_steps_run_id ON workflow_steps (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_events (
        event_id       TEXT PRIMARY KEY,
        run_id         TEXT NOT NULL,
        event_type     TEXT NOT NULL,
        correlation_id TEXT,
        event_data     TEXT NOT NULL,
        created_at     TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_events_run_id ON workflow_events (run_id)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_events_correlation_id ON workflow_events (correlation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_hooks (
        hook_id     TEXT PRIMARY KEY,
        run_id      TEXT NOT NULL,
        token       TEXT NOT NULL,
        owner_id    TEXT NOT NULL,
        project_id  TEXT NOT NULL,
        environment TEXT NOT NULL,
        metadata    TEXT NOT NULL,
        created_at  TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_hooks_token ON workflow_hooks (token)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_hooks_run_id ON workflow_hooks (run_id)",
    r#"
    CREATE TABLE IF NOT EXISTS workflow_stream_chunks (
        stream_id  TEXT NOT NULL,
        chunk_id   TEXT NOT NULL,
        chunk_data BLOB NOT NULL,
        eof        INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (stream_id, chunk_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_jobs (
        id              TEXT PRIMARY KEY,
        queue_name      TEXT NOT NULL,
        payload         TEXT NOT NULL,
        status          TEXT NOT NULL,
        attempts        INTEGER NOT NULL DEFAULT 0,
        max_attempts    INTEGER NOT NULL DEFAULT 3,
        locked_until    TEXT,
        scheduled_for   TEXT NOT NULL,
        idempotency_key TEXT,
        error           TEXT,
        created_at      TEXT NOT NULL,
        updated_at      TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_jobs_poll ON workflow_jobs (queue_name, status, scheduled_for)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_jobs_idempotency_key ON workflow_jobs (idempotency_key)",
];

/// Apply the fixed schema for the pool's back-end
pub async fn setup(pool: &DbPool) -> Result<()> {
    match pool {
        DbPool::Postgres(pg) => {
            for statement in POSTGRES_SCHEMA {
                sqlx::query(statement).execute(pg).await?;
            }
        }
        DbPool::MySql(mysql) => {
            for statement in MYSQL_SCHEMA {
                sqlx::query(statement).execute(mysql).await?;
            }
        }
        DbPool::Sqlite(sqlite) => {
            for statement in SQLITE_SCHEMA {
                sqlx::query(statement).execute(sqlite).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DatabaseKind, DbPool};

    #[tokio::test]
    async fn test_sqlite_setup_is_idempotent() {
        let pool = DbPool::connect(DatabaseKind::Sqlite, ":memory:")
            .await
            .unwrap();
        setup(&pool).await.unwrap();
        setup(&pool).await.unwrap();
        pool.close().await;
    }
}
