/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::time::Duration;

use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

use crate::{Error, Result};

pub mod accounts;
pub mod affinity;
pub mod fetch;
pub mod mailboxes;
pub mod messages;
pub mod search;
pub mod sieve;
pub mod tracking;
pub mod uploads;

pub struct PgStore {
    /// Writer pool, also serving pinned reads after a session write.
    pub(crate) write_pool: Pool,
    /// Read pool; points at a replica when one is configured.
    pub(crate) read_pool: Pool,
    pub(crate) instance_id: String,
}

pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub read_host: Option<String>,
    pub max_connections: usize,
    pub connect_timeout: Option<Duration>,
    pub create_tables: bool,
    pub instance_id: String,
}

impl PgStore {
    pub async fn open(config: PgConfig) -> Result<Self> {
        let write_pool = build_pool(&config, &config.host)?;
        let read_pool = match &config.read_host {
            Some(read_host) => build_pool(&config, read_host)?,
            None => write_pool.clone(),
        };

        let store = PgStore {
            write_pool,
            read_pool,
            instance_id: config.instance_id,
        };

        if config.create_tables {
            store.create_tables().await?;
        }

        Ok(store)
    }

    /// Routes reads to the writer when the caller is pinned after a write,
    /// avoiding replica lag inside a session.
    pub(crate) fn reader(&self, pinned: bool) -> &Pool {
        if pinned {
            &self.write_pool
        } else {
            &self.read_pool
        }
    }

    pub(crate) async fn write_conn(&self) -> Result<deadpool_postgres::Object> {
        self.write_pool.get().await.map_err(pool_error)
    }

    pub(crate) async fn read_conn(&self, pinned: bool) -> Result<deadpool_postgres::Object> {
        self.reader(pinned).get().await.map_err(pool_error)
    }

    pub async fn create_tables(&self) -> Result<()> {
        let conn = self.write_conn().await?;
        for statement in SCHEMA.split("-- statement\n").map(str::trim) {
            if !statement.is_empty() {
                conn.batch_execute(statement).await.map_err(into_error)?;
            }
        }
        Ok(())
    }
}

fn build_pool(config: &PgConfig, host: &str) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(host.to_string());
    cfg.port = Some(config.port);
    cfg.dbname = Some(config.database.clone());
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.connect_timeout = config.connect_timeout;
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(PoolConfig::new(config.max_connections));
    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|err| Error::internal(format!("Failed to create connection pool: {err}")))
}

fn pool_error(err: deadpool_postgres::PoolError) -> Error {
    Error::transient(format!("Connection pool error: {err}"))
}

/// Classifies driver errors into the shared taxonomy; the retry layer keys
/// off `Transient`.
pub(crate) fn into_error(err: tokio_postgres::Error) -> Error {
    if let Some(db_err) = err.as_db_error() {
        use tokio_postgres::error::SqlState;
        let code = db_err.code();
        if *code == SqlState::UNIQUE_VIOLATION {
            Error::unique_violation(db_err.message().to_string())
        } else if [
            SqlState::T_R_SERIALIZATION_FAILURE,
            SqlState::T_R_DEADLOCK_DETECTED,
            SqlState::ADMIN_SHUTDOWN,
            SqlState::CRASH_SHUTDOWN,
            SqlState::CANNOT_CONNECT_NOW,
            SqlState::TOO_MANY_CONNECTIONS,
            SqlState::LOCK_NOT_AVAILABLE,
        ]
        .contains(code)
        {
            Error::transient(db_err.message().to_string())
        } else if [SqlState::FOREIGN_KEY_VIOLATION, SqlState::CHECK_VIOLATION].contains(code) {
            Error::malformed(db_err.message().to_string())
        } else if *code == SqlState::QUERY_CANCELED {
            Error::cancelled()
        } else {
            Error::internal(db_err.message().to_string())
        }
    } else if err.is_closed() {
        Error::transient("Database connection closed")
    } else {
        Error::transient(format!("Database error: {err}"))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    deleted_at TIMESTAMPTZ
)
-- statement
CREATE TABLE IF NOT EXISTS credentials (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    address TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    is_primary BOOLEAN NOT NULL DEFAULT false,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
-- statement
CREATE UNIQUE INDEX IF NOT EXISTS credentials_one_primary_idx
    ON credentials (account_id) WHERE is_primary
-- statement
CREATE TABLE IF NOT EXISTS mailboxes (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    uid_validity BIGINT NOT NULL DEFAULT extract(epoch from now())::bigint,
    highest_uid BIGINT NOT NULL DEFAULT 0,
    subscribed BOOLEAN NOT NULL DEFAULT true,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (account_id, name)
)
-- statement
CREATE SEQUENCE IF NOT EXISTS messages_modseq
-- statement
CREATE TABLE IF NOT EXISTS message_contents (
    content_hash TEXT PRIMARY KEY,
    text_body TEXT,
    text_body_tsv TSVECTOR,
    headers TEXT NOT NULL DEFAULT '',
    headers_tsv TSVECTOR,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
-- statement
CREATE TABLE IF NOT EXISTS messages (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    mailbox_id BIGINT NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
    mailbox_path TEXT NOT NULL,
    uid BIGINT NOT NULL,
    message_id TEXT NOT NULL,
    content_hash TEXT NOT NULL REFERENCES message_contents(content_hash),
    flags INTEGER NOT NULL DEFAULT 0,
    custom_flags JSONB NOT NULL DEFAULT '[]',
    internal_date TIMESTAMPTZ NOT NULL DEFAULT now(),
    sent_date TIMESTAMPTZ NOT NULL DEFAULT now(),
    size BIGINT NOT NULL,
    subject TEXT NOT NULL DEFAULT '',
    in_reply_to TEXT NOT NULL DEFAULT '',
    recipients_json JSONB NOT NULL DEFAULT '[]',
    subject_sort TEXT NOT NULL DEFAULT '',
    from_name_sort TEXT NOT NULL DEFAULT '',
    from_email_sort TEXT NOT NULL DEFAULT '',
    to_email_sort TEXT NOT NULL DEFAULT '',
    cc_email_sort TEXT NOT NULL DEFAULT '',
    uploaded BOOLEAN NOT NULL DEFAULT false,
    flags_changed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_modseq BIGINT NOT NULL DEFAULT nextval('messages_modseq'),
    updated_modseq BIGINT,
    expunged_at TIMESTAMPTZ,
    expunged_modseq BIGINT
)
-- statement
CREATE UNIQUE INDEX IF NOT EXISTS messages_mailbox_uid_live_idx
    ON messages (mailbox_id, uid) WHERE expunged_at IS NULL
-- statement
CREATE UNIQUE INDEX IF NOT EXISTS messages_mailbox_message_id_live_idx
    ON messages (mailbox_id, message_id) WHERE expunged_at IS NULL
-- statement
CREATE INDEX IF NOT EXISTS messages_content_hash_idx ON messages (content_hash)
-- statement
CREATE INDEX IF NOT EXISTS messages_mailbox_modseq_idx
    ON messages (mailbox_id, updated_modseq)
-- statement
CREATE TABLE IF NOT EXISTS message_sequences (
    mailbox_id BIGINT NOT NULL,
    uid BIGINT NOT NULL,
    seqnum BIGINT NOT NULL,
    PRIMARY KEY (mailbox_id, uid)
)
-- statement
CREATE OR REPLACE FUNCTION messages_resequence() RETURNS trigger AS $fn$
DECLARE
    mbx BIGINT;
BEGIN
    mbx := COALESCE(NEW.mailbox_id, OLD.mailbox_id);
    PERFORM pg_advisory_xact_lock(mbx);
    DELETE FROM message_sequences WHERE mailbox_id = mbx;
    INSERT INTO message_sequences (mailbox_id, uid, seqnum)
        SELECT mailbox_id, uid, row_number() OVER (ORDER BY uid)
        FROM messages
        WHERE mailbox_id = mbx AND expunged_at IS NULL;
    RETURN NULL;
END;
$fn$ LANGUAGE plpgsql
-- statement
DROP TRIGGER IF EXISTS messages_resequence ON messages;
CREATE TRIGGER messages_resequence
    AFTER INSERT OR UPDATE OR DELETE ON messages
    FOR EACH ROW EXECUTE FUNCTION messages_resequence()
-- statement
CREATE TABLE IF NOT EXISTS pending_uploads (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    instance_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    account_id BIGINT NOT NULL,
    size BIGINT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TIMESTAMPTZ,
    next_attempt_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (content_hash, account_id)
)
-- statement
CREATE TABLE IF NOT EXISTS sieve_scripts (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    account_id BIGINT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    script TEXT NOT NULL,
    active BOOLEAN NOT NULL DEFAULT false,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (account_id, name)
)
-- statement
CREATE UNIQUE INDEX IF NOT EXISTS sieve_scripts_one_active_idx
    ON sieve_scripts (account_id) WHERE active
-- statement
CREATE TABLE IF NOT EXISTS active_connections (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    account_id BIGINT NOT NULL,
    email TEXT NOT NULL,
    protocol TEXT NOT NULL,
    client_addr TEXT NOT NULL,
    server_addr TEXT NOT NULL,
    connected_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    termination_requested_at TIMESTAMPTZ
)
-- statement
CREATE TABLE IF NOT EXISTS auth_attempts (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    ip TEXT NOT NULL,
    username TEXT NOT NULL,
    success BOOLEAN NOT NULL,
    attempted_at TIMESTAMPTZ NOT NULL DEFAULT now()
)
-- statement
CREATE TABLE IF NOT EXISTS health_status (
    component TEXT NOT NULL,
    hostname TEXT NOT NULL,
    status TEXT NOT NULL,
    details JSONB NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (component, hostname)
)
-- statement
CREATE TABLE IF NOT EXISTS server_affinity (
    account TEXT NOT NULL,
    protocol TEXT NOT NULL,
    backend TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (account, protocol)
)
"#;
