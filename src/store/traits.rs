//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::identity::model::{
    CredentialRecord, RegistrationSession, Role, StagedRegistration, UserRecord,
};
use crate::pipeline::cursor::ProvisioningRecord;

/// Backend-agnostic database trait covering identity, provisioning and
/// client settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Read a JSON setting for a user/client id.
    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Insert or replace a JSON setting.
    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Delete a setting. Returns whether a row was removed.
    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    /// Whether a verified account exists for (email, role).
    async fn account_exists(&self, email: &str, role: Role) -> Result<bool, DatabaseError>;

    /// Insert a verified account. Fails with `Constraint` on a duplicate
    /// (email, role).
    async fn insert_account(
        &self,
        user: &UserRecord,
        password_hash: &str,
    ) -> Result<(), DatabaseError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<UserRecord>, DatabaseError>;

    // ── Registration sessions ───────────────────────────────────────

    /// Stage a registration for (email, role).
    ///
    /// Atomically either inserts `candidate` as the single pending session
    /// for its (email, role), or refreshes the live pending session with the
    /// candidate's name, phone, code hash and expiry and returns it with
    /// `reused = true`. The refresh only applies when the pending session's
    /// `password_hash` equals the candidate's; otherwise the pending session
    /// is left untouched and `None` is returned. Pending sessions already
    /// past expiry are marked expired first.
    async fn stage_registration(
        &self,
        candidate: &RegistrationSession,
        now: DateTime<Utc>,
    ) -> Result<Option<StagedRegistration>, DatabaseError>;

    /// The pending, unexpired session for (email, role), if any.
    async fn find_pending_registration(
        &self,
        email: &str,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistrationSession>, DatabaseError>;

    async fn get_registration_session(
        &self,
        id: Uuid,
    ) -> Result<Option<RegistrationSession>, DatabaseError>;

    /// Count a wrong code against a pending session. Returns the new count,
    /// or `None` if the session is no longer pending.
    async fn record_failed_attempt(&self, id: Uuid) -> Result<Option<u32>, DatabaseError>;

    /// In one transaction: move the session `pending → consumed` (only if it
    /// is still pending and unexpired at `now`), insert the account and
    /// insert its credential. Returns `false` when the session was not
    /// pending; any failure rolls the whole exchange back.
    async fn complete_registration(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
        user: &UserRecord,
        password_hash: &str,
        credential: &CredentialRecord,
    ) -> Result<bool, DatabaseError>;

    /// Move a session `pending → expired`. Returns whether it changed.
    async fn expire_registration_session(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Credentials ─────────────────────────────────────────────────

    async fn insert_credential(&self, record: &CredentialRecord) -> Result<(), DatabaseError>;

    async fn find_credential(
        &self,
        token_hash: &str,
    ) -> Result<Option<CredentialRecord>, DatabaseError>;

    // ── Provisioning ────────────────────────────────────────────────

    async fn get_provisioning_record(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError>;

    async fn get_provisioning_record_by_gym(
        &self,
        gym_id: &str,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError>;

    /// Store the inputs a run provisions from, keyed by (owner, session).
    /// Replaces earlier inputs.
    async fn save_provisioning_inputs(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
        inputs: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    async fn get_provisioning_inputs(
        &self,
        owner_id: Uuid,
        session_id: Uuid,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Insert or update the record keyed by (owner_id, session_id).
    async fn save_provisioning_record(
        &self,
        record: &ProvisioningRecord,
    ) -> Result<(), DatabaseError>;

    /// Finalized records whose verified flag is unset, oldest first.
    async fn list_unverified_records(&self) -> Result<Vec<ProvisioningRecord>, DatabaseError>;

    /// Records holding a gym id that are not finalized and were last touched
    /// before `updated_before`.
    async fn list_stalled_records(
        &self,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<ProvisioningRecord>, DatabaseError>;

    /// Set the verified flag on a finalized record. Returns the updated
    /// record, or `None` when no finalized record holds `gym_id`.
    async fn set_record_verified(
        &self,
        gym_id: &str,
        verified: bool,
    ) -> Result<Option<ProvisioningRecord>, DatabaseError>;

    // ── Leases ──────────────────────────────────────────────────────

    /// Take the lease `key` for `holder` until `expires_at`. Succeeds when
    /// the lease is free or its previous holder's lease ran out.
    async fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn release_lease(&self, key: &str, holder: &str) -> Result<(), DatabaseError>;
}
