//! Admin review queue over provisioning records.
//!
//! Two disjoint views: finalized gyms waiting for a verification decision,
//! and gyms whose provisioning stopped part-way for longer than the grace
//! period. The decision itself is made by a human elsewhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tracing::info;

use crate::error::DatabaseError;
use crate::pipeline::ProvisioningRecord;
use crate::store::Database;

pub struct ReviewQueue {
    db: Arc<dyn Database>,
    stuck_grace: TimeDelta,
}

impl ReviewQueue {
    pub fn new(db: Arc<dyn Database>, stuck_grace: Duration) -> Self {
        Self {
            db,
            stuck_grace: TimeDelta::from_std(stuck_grace).unwrap_or(TimeDelta::minutes(15)),
        }
    }

    /// Finalized, not yet verified.
    pub async fn list_unverified(&self) -> Result<Vec<ProvisioningRecord>, DatabaseError> {
        self.db.list_unverified_records().await
    }

    /// Created but not finalized, untouched for longer than the grace period.
    pub async fn list_stuck(&self) -> Result<Vec<ProvisioningRecord>, DatabaseError> {
        self.db
            .list_stalled_records(Utc::now() - self.stuck_grace)
            .await
    }

    /// Record the admin decision for a finalized gym.
    pub async fn set_verified(
        &self,
        gym_id: &str,
        verified: bool,
    ) -> Result<ProvisioningRecord, DatabaseError> {
        let record = self
            .db
            .set_record_verified(gym_id, verified)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "finalized gym".into(),
                id: gym_id.to_string(),
            })?;
        info!(gym_id = %gym_id, verified, "Gym verification updated");
        Ok(record)
    }
}
