//! Schema bootstrap.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS inbound_updates (
        id BIGSERIAL PRIMARY KEY,
        external_id BIGINT NOT NULL UNIQUE,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        last_error TEXT,
        received_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ,
        locked_until TIMESTAMPTZ,
        claim_token UUID,
        CONSTRAINT inbound_updates_status_check
            CHECK (status IN ('pending', 'processing', 'retry', 'processed', 'failed'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbound_messages (
        id BIGSERIAL PRIMARY KEY,
        destination BIGINT NOT NULL,
        method TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        next_attempt_at TIMESTAMPTZ,
        locked_until TIMESTAMPTZ,
        claim_token UUID,
        CONSTRAINT outbound_messages_status_check
            CHECK (status IN ('pending', 'processing', 'retry', 'sent', 'failed'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_updates (
        update_id BIGINT PRIMARY KEY,
        update_kind TEXT,
        chat_id BIGINT,
        seen_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_inbound_updates_claimable
        ON inbound_updates (received_at, id)
        WHERE status IN ('pending', 'retry', 'processing')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbound_messages_claimable
        ON outbound_messages (created_at, id)
        WHERE status IN ('pending', 'retry', 'processing')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_outbound_messages_destination
        ON outbound_messages (destination, created_at)
    "#,
];

/// Applies every statement in order. All statements are idempotent.
pub(crate) async fn apply(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_is_idempotent() {
        for statement in STATEMENTS {
            assert!(statement.contains("IF NOT EXISTS"), "not idempotent: {statement}");
        }
    }

    #[test]
    fn inbound_external_id_is_unique() {
        assert!(STATEMENTS[0].contains("external_id BIGINT NOT NULL UNIQUE"));
    }
}
