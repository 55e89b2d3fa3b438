//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::model::{
    CredentialRecord, RegistrationSession, Role, SessionState, StagedRegistration, UserRecord,
};
use crate::pipeline::cursor::{PipelineCursor, ProvisioningRecord};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Held for the lifetime of a transaction on `conn`; local statements
    /// run to completion without yielding, so this keeps transactions from
    /// nesting.
    tx_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            tx_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            tx_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ProvisioningRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC, so stored
/// timestamps compare correctly as text.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn map_write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const SESSION_COLUMNS: &str = "id, email, role, display_name, phone, password_hash, code_hash, state, failed_attempts, created_at, expires_at, consumed_at";

const ACCOUNT_COLUMNS: &str = "id, name, email, phone, role, created_at";

const RECORD_COLUMNS: &str = "owner_id, session_id, gym_id, state, verified, attempts, failed_step, last_error, created_at, updated_at";

/// Map a libsql Row to a RegistrationSession. Column order matches SESSION_COLUMNS.
async fn insert_account_row(
    conn: &Connection,
    user: &UserRecord,
    password_hash: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO accounts (id, email, role, name, phone, password_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id.to_string(),
            user.email.as_str(),
            user.role.as_str(),
            user.name.as_str(),
            user.phone.as_str(),
            password_hash,
            fmt_ts(user.created_at),
        ],
    )
    .await
    .map_err(|e| map_write_err("insert_account", e))?;
    Ok(())
}

async fn insert_credential_row(
    conn: &Connection,
    record: &CredentialRecord,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO credentials (token_hash, user_id, session_id, issued_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            record.token_hash.as_str(),
            record.user_id.to_string(),
            record.session_id.to_string(),
            fmt_ts(record.issued_at),
        ],
    )
    .await
    .map_err(|e| map_write_err("insert_credential", e))?;
    Ok(())
}

fn row_to_session(row: &libsql::Row) -> Result<RegistrationSession, DatabaseError> {
    let get = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Serialization(format!("session column {i}: {e}")))
    };
    let consumed_at: Option<String> = row.get(11).ok();
    let failed_attempts: i64 = row.get(8).unwrap_or(0);

    Ok(RegistrationSession {
        id: parse_uuid(&get(0)?)?,
        email: get(1)?,
        role: parse_enum(&get(2)?)?,
        display_name: get(3)?,
        phone: get(4)?,
        password_hash: get(5)?,
        code_hash: get(6)?,
        state: parse_enum(&get(7)?)?,
        failed_attempts: failed_attempts.max(0) as u32,
        created_at: parse_datetime(&get(9)?),
        expires_at: parse_datetime(&get(10)?),
        consumed_at: parse_optional_datetime(&consumed_at),
    })
}

fn row_to_account(row: &libsql::Row) -> Result<UserRecord, DatabaseError> {
    let get = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Serialization(format!("account column {i}: {e}")))
    };
    Ok(UserRecord {
        id: parse_uuid(&get(0)?)?,
        name: get(1)?,
        email: get(2)?,
        phone: get(3)?,
        role: parse_enum(&get(4)?)?,
        created_at: parse_datetime(&get(5)?),
    })
}

fn row_to_record(row: &libsql::Row) -> Result<ProvisioningRecord, DatabaseError> {
    let get = |i: i32| -> Result<String, DatabaseError> {
        row.get::<String>(i)
            .map_err(|e| DatabaseError::Serialization(format!("record column {i}: {e}")))
    };
    let gym_id: Option<String> = row.get(2).ok();
    let verified: i64 = row.get(4).unwrap_or(0);
    let attempts: i64 = row.get(5).unwrap_or(0);
    let failed_step: Option<String> = row.get(6).ok();
    let last_error: Option<String> = row.get(7).ok();

    Ok(ProvisioningRecord {
        owner_id: parse_uuid(&get(0)?)?,
        session_id: parse_uuid(&get(1)?)?,
        gym_id,
        state: parse_enum(&get(3)?)?,
        verified: verified != 0,
        attempts: attempts.max(0) as u32,
        failed_step: failed_step.as_deref().map(parse_enum).transpose()?,
        last_error,
        created_at: parse_datetime(&get(8)?),
        updated_at: parse_datetime(&get(9)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO settings (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![user_id, key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;

        Ok(())
    }

    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_setting: {e}")))?;
        Ok(count > 0)
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn account_exists(&self, email: &str, role: Role) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM accounts WHERE email = ?1 AND role = ?2",
                params![email, role.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("account_exists: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("account_exists: {e}"))),
        }
    }

    async fn insert_account(
        &self,
        user: &UserRecord,
        password_hash: &str,
    ) -> Result<(), DatabaseError> {
        insert_account_row(self.conn(), user, password_hash).await?;
        debug!(user_id = %user.id, "Account inserted");
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account: {e}"))),
        }
    }

    // ── Registration sessions ───────────────────────────────────────

    async fn stage_registration(
        &self,
        candidate: &RegistrationSession,
        now: DateTime<Utc>,
    ) -> Result<Option<StagedRegistration>, DatabaseError> {
        let conn = self.conn();
        let email = candidate.email.as_str();
        let role = candidate.role.as_str();

        let expired = conn
            .execute(
                "UPDATE registration_sessions SET state = 'expired'
                 WHERE email = ?1 AND role = ?2 AND state = 'pending' AND expires_at <= ?3",
                params![email, role, fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stage_registration: {e}")))?;
        if expired > 0 {
            debug!(email = %email, role = %role, "Expired stale pending session");
        }

        // Two rounds: the pending session we meant to refresh may be consumed
        // or expired between the insert and the update.
        for _ in 0..2 {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO registration_sessions
                     (id, email, role, display_name, phone, password_hash, code_hash,
                      state, failed_attempts, created_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?9)",
                    params![
                        candidate.id.to_string(),
                        email,
                        role,
                        candidate.display_name.as_str(),
                        candidate.phone.as_str(),
                        candidate.password_hash.as_str(),
                        candidate.code_hash.as_str(),
                        fmt_ts(candidate.created_at),
                        fmt_ts(candidate.expires_at),
                    ],
                )
                .await
                .map_err(|e| map_write_err("stage_registration", e))?;

            if inserted == 1 {
                return Ok(Some(StagedRegistration {
                    session: candidate.clone(),
                    reused: false,
                }));
            }

            // The staged password is part of the match: a caller that does
            // not hold it cannot rewrite the pending identity.
            let refreshed = conn
                .execute(
                    "UPDATE registration_sessions
                     SET display_name = ?3, phone = ?4, code_hash = ?6,
                         failed_attempts = 0, expires_at = ?7
                     WHERE email = ?1 AND role = ?2 AND state = 'pending'
                       AND password_hash = ?5",
                    params![
                        email,
                        role,
                        candidate.display_name.as_str(),
                        candidate.phone.as_str(),
                        candidate.password_hash.as_str(),
                        candidate.code_hash.as_str(),
                        fmt_ts(candidate.expires_at),
                    ],
                )
                .await
                .map_err(|e| map_write_err("stage_registration", e))?;

            let pending = self
                .find_pending_registration(&candidate.email, candidate.role, now)
                .await?;
            match pending {
                Some(session) if refreshed == 1 => {
                    return Ok(Some(StagedRegistration {
                        session,
                        reused: true,
                    }));
                }
                Some(_) => return Ok(None),
                None => {}
            }
        }

        Err(DatabaseError::Constraint(format!(
            "could not stage a pending session for {email} as {role}"
        )))
    }

    async fn find_pending_registration(
        &self,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistrationSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM registration_sessions
                     WHERE email = ?1 AND role = ?2 AND state = 'pending' AND expires_at > ?3"
                ),
                params![email, role.as_str(), fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_pending_registration: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_pending_registration: {e}"))),
        }
    }

    async fn get_registration_session(
        &self,
        id: Uuid,
    ) -> Result<Option<RegistrationSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM registration_sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_registration_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_session(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_registration_session: {e}"))),
        }
    }

    async fn record_failed_attempt(&self, id: Uuid) -> Result<Option<u32>, DatabaseError> {
        let conn = self.conn();
        let updated = conn
            .execute(
                "UPDATE registration_sessions SET failed_attempts = failed_attempts + 1
                 WHERE id = ?1 AND state = 'pending'",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_failed_attempt: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }

        let session = self.get_registration_session(id).await?;
        Ok(session.map(|s| s.failed_attempts))
    }

    async fn complete_registration(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        user: &UserRecord,
        password_hash: &str,
        credential: &CredentialRecord,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.tx_lock.lock().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_registration: {e}")))?;

        let result = async {
            let now = fmt_ts(now);
            let consumed = tx
                .execute(
                    "UPDATE registration_sessions SET state = ?2, consumed_at = ?3
                     WHERE id = ?1 AND state = 'pending' AND expires_at > ?3",
                    params![session_id.to_string(), SessionState::Consumed.as_str(), now],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("complete_registration: {e}")))?;
            if consumed == 0 {
                return Ok(false);
            }
            insert_account_row(&tx, user, password_hash).await?;
            insert_credential_row(&tx, credential).await?;
            Ok::<bool, DatabaseError>(true)
        }
        .await;

        match result {
            Ok(true) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("complete_registration: {e}")))?;
                debug!(session_id = %session_id, user_id = %user.id, "Registration completed");
                Ok(true)
            }
            Ok(false) => {
                tx.rollback()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("complete_registration: {e}")))?;
                Ok(false)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(session_id = %session_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn expire_registration_session(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE registration_sessions SET state = ?2 WHERE id = ?1 AND state = 'pending'",
                params![id.to_string(), SessionState::Expired.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_registration_session: {e}")))?;
        Ok(updated == 1)
    }

    // ── Credentials ─────────────────────────────────────────────────

    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), DatabaseError> {
        insert_credential_row(self.conn(), record).await
    }

    async fn find_credential(
        &self,
        token_hash: &str,
    ) -> Result<Option<CredentialRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT token_hash, user_id, session_id, issued_at FROM credentials
                 WHERE token_hash = ?1",
                params![token_hash],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_credential: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("find_credential: {e}"))),
        };
        let get = |i: i32| -> Result<String, DatabaseError> {
            row.get::<String>(i)
                .map_err(|e| DatabaseError::Serialization(format!("credential column {i}: {e}")))
        };
        Ok(Some(CredentialRecord {
            token_hash: get(0)?,
            user_id: parse_uuid(&get(1)?)?,
            session_id: parse_uuid(&get(2)?)?,
            issued_at: parse_datetime(&get(3)?),
        }))
    }

    // ── Provisioning ────────────────────────────────────────────────

    async fn get_provisioning_record(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError> {
        let records = self
            .query_records(
                "get_provisioning_record",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM provisioning_records
                     WHERE owner_id = ?1 AND session_id = ?2"
                ),
                params![owner_id.to_string(), session_id.to_string()],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn get_provisioning_record_by_gym(
        &self,
        gym_id: &str,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError> {
        let records = self
            .query_records(
                "get_provisioning_record_by_gym",
                &format!("SELECT {RECORD_COLUMNS} FROM provisioning_records WHERE gym_id = ?1"),
                params![gym_id],
            )
            .await?;
        Ok(records.into_iter().next())
    }

    async fn save_provisioning_inputs(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO provisioning_inputs (owner_id, session_id, draft, saved_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (owner_id, session_id)
                 DO UPDATE SET draft = excluded.draft, saved_at = excluded.saved_at",
                params![
                    owner_id.to_string(),
                    session_id.to_string(),
                    inputs.to_string(),
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| map_write_err("save_provisioning_inputs", e))?;
        Ok(())
    }

    async fn get_provisioning_inputs(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT draft FROM provisioning_inputs WHERE owner_id = ?1 AND session_id = ?2",
                params![owner_id.to_string(), session_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_provisioning_inputs: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_provisioning_inputs: {e}")))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_provisioning_inputs: {e}"))),
        }
    }

    async fn save_provisioning_record(
        &self,
        record: &ProvisioningRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO provisioning_records
                 (owner_id, session_id, gym_id, state, verified, attempts, failed_step,
                  last_error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (owner_id, session_id) DO UPDATE SET
                    gym_id = ?3, state = ?4, verified = ?5, attempts = ?6,
                    failed_step = ?7, last_error = ?8, updated_at = ?10",
                params![
                    record.owner_id.to_string(),
                    record.session_id.to_string(),
                    opt_text(record.gym_id.as_deref()),
                    record.state.as_str(),
                    i64::from(record.verified),
                    i64::from(record.attempts),
                    opt_text(record.failed_step.map(|s| s.as_str())),
                    opt_text(record.last_error.as_deref()),
                    fmt_ts(record.created_at),
                    fmt_ts(record.updated_at),
                ],
            )
            .await
            .map_err(|e| map_write_err("save_provisioning_record", e))?;
        Ok(())
    }

    async fn list_unverified_records(&self) -> Result<Vec<ProvisioningRecord>, DatabaseError> {
        self.query_records(
            "list_unverified_records",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM provisioning_records
                 WHERE state = ?1 AND verified = 0
                 ORDER BY updated_at ASC"
            ),
            params![PipelineCursor::Finalized.as_str()],
        )
        .await
    }

    async fn list_stalled_records(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<ProvisioningRecord>, DatabaseError> {
        self.query_records(
            "list_stalled_records",
            &format!(
                "SELECT {RECORD_COLUMNS} FROM provisioning_records
                 WHERE gym_id IS NOT NULL AND state != ?1 AND updated_at < ?2
                 ORDER BY updated_at ASC"
            ),
            params![PipelineCursor::Finalized.as_str(), fmt_ts(updated_before)],
        )
        .await
    }

    async fn set_record_verified(
        &self,
        gym_id: &str,
        verified: bool,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE provisioning_records SET verified = ?2, updated_at = ?3
                 WHERE gym_id = ?1 AND state = ?4",
                params![
                    gym_id,
                    i64::from(verified),
                    fmt_ts(Utc::now()),
                    PipelineCursor::Finalized.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_record_verified: {e}")))?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_provisioning_record_by_gym(gym_id).await
    }

    // ── Leases ──────────────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT INTO pipeline_leases (key, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE pipeline_leases.expires_at <= excluded.acquired_at",
                params![key, holder, fmt_ts(now), fmt_ts(expires_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease: {e}")))?;
        Ok(changed == 1)
    }

    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM pipeline_leases WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(())
    }
}
