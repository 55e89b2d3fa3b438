//! Registration wizard — the client-owned draft and its five ordered steps.
//!
//! The wizard is purely local: edits, validation and navigation never leave
//! the process. Only the final submit hands the draft to the identity layer.

pub mod draft;
pub mod manager;
pub mod step;

pub use draft::{
    DraftField, DraftPatch, OWNER_ID_DOCUMENT_SLOT, PAN_DOCUMENT_SLOT, RegistrationDraft,
};
pub use manager::{StepValidation, Submission, WizardStateManager};
pub use step::WizardStep;
