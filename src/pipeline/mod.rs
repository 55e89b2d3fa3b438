//! Provisioning pipeline — builds the business profile, its media and its
//! compliance documents, then finalizes it.
//!
//! Steps run strictly in order under the owner's credential:
//! 1. `create_business_profile` (idempotency key `"{owner_id}:{session_id}"`)
//! 2. `attach_media`
//! 3. `attach_compliance_documents`
//! 4. `finalize`
//!
//! The cursor is persisted after every step, so a failed run resumes at the
//! first step that has not succeeded. A lease row keeps two runs for the same
//! key from overlapping.

pub mod cursor;
pub mod profile_client;
pub mod runner;
pub mod service;

pub use cursor::{PipelineCursor, PipelineStep, ProvisioningRecord};
pub use profile_client::HttpProfileService;
pub use runner::{ProvisioningOutcome, ProvisioningPipeline};
pub use service::{BusinessProfile, ProfileService};
