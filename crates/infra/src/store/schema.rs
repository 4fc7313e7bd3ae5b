//! Postgres schema for simulations, the job backlog and generation checkpoints.

use sqlx::PgPool;
use tracing::info;

const CREATE_STATEMENTS: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS simulations (
        id          BIGSERIAL PRIMARY KEY,
        owner_id    BIGINT  NOT NULL,
        name        TEXT    NOT NULL,
        description TEXT    NULL,
        width       INTEGER NOT NULL CHECK (width > 0),
        height      INTEGER NOT NULL CHECK (height > 0),
        state_count INTEGER NOT NULL CHECK (state_count BETWEEN 1 AND 256),
        rule_set    TEXT    NOT NULL,
        status      TEXT    NOT NULL DEFAULT 'PENDING'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id                      BIGSERIAL   PRIMARY KEY,
        simulation_id           BIGINT      NOT NULL REFERENCES simulations (id),
        target_generation_count BIGINT      NOT NULL CHECK (target_generation_count > 0),
        last_activity           TIMESTAMPTZ NOT NULL,
        lease_token             UUID        NULL,
        claimed_by              TEXT        NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_last_activity_idx ON jobs (last_activity, id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generations (
        simulation_id BIGINT NOT NULL REFERENCES simulations (id),
        iteration     BIGINT NOT NULL CHECK (iteration >= 0),
        content       BYTEA  NOT NULL,
        PRIMARY KEY (simulation_id, iteration)
    )
    "#,
];

/// Create every table the worker needs (idempotent).
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in CREATE_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database schema ready");
    Ok(())
}

/// Drop every table created by [`ensure_schema`]. Development teardown only.
pub async fn drop_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("DROP TABLE IF EXISTS generations, jobs, simulations")
        .execute(pool)
        .await?;
    info!("database schema dropped");
    Ok(())
}
