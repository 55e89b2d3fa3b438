//! WizardStateManager — local draft edits, step validation and navigation.
//!
//! Nothing in here touches the network; the draft only leaves the manager at
//! final submit via [`WizardStateManager::submission`].

use secrecy::ExposeSecret;
use serde::Serialize;

use crate::error::ValidationError;
use crate::identity::model::{RegistrationRequest, Role};

use super::draft::{
    DraftField, DraftPatch, OWNER_ID_DOCUMENT_SLOT, PAN_DOCUMENT_SLOT, RegistrationDraft,
};
use super::step::WizardStep;

/// A validated draft ready for the identity layer.
#[derive(Debug)]
pub struct Submission {
    /// Identity part, registered as a gym partner.
    pub request: RegistrationRequest,
    /// Frozen copy of the whole draft.
    pub draft: RegistrationDraft,
}

/// Outcome of validating a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepValidation {
    pub ok: bool,
    pub missing_fields: Vec<DraftField>,
}

impl StepValidation {
    fn from_missing(missing_fields: Vec<DraftField>) -> Self {
        Self {
            ok: missing_fields.is_empty(),
            missing_fields,
        }
    }

    fn into_result(self, step: WizardStep) -> Result<(), ValidationError> {
        if self.ok {
            Ok(())
        } else {
            Err(ValidationError {
                step: step.index(),
                missing: self.missing_fields,
            })
        }
    }
}

/// Holds the registration draft and the step cursor.
#[derive(Debug, Clone, Default)]
pub struct WizardStateManager {
    draft: RegistrationDraft,
}

impl WizardStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a previously captured draft (e.g. a recovery snapshot).
    pub fn from_draft(draft: RegistrationDraft) -> Self {
        Self { draft }
    }

    pub fn draft(&self) -> &RegistrationDraft {
        &self.draft
    }

    pub fn current_step(&self) -> WizardStep {
        self.draft.step
    }

    /// Merge a partial patch into the draft.
    pub fn update_field(&mut self, patch: DraftPatch) {
        patch.apply(&mut self.draft);
    }

    /// Validate the fields a step requires before it can be left.
    pub fn validate_step(&self, step: WizardStep) -> StepValidation {
        let missing = match step {
            WizardStep::BusinessDetails => self.missing_business_details(),
            WizardStep::Documents => self.missing_documents(),
            WizardStep::Category | WizardStep::Facilities | WizardStep::Photos => Vec::new(),
        };
        StepValidation::from_missing(missing)
    }

    /// Same as [`validate_step`](Self::validate_step) for a raw 1-based index.
    pub fn validate_step_index(&self, index: u8) -> Option<StepValidation> {
        WizardStep::from_index(index).map(|step| self.validate_step(step))
    }

    /// Advance one step if the current one validates.
    ///
    /// On the last step this is a no-op once it validates.
    pub fn next(&mut self) -> Result<WizardStep, ValidationError> {
        let current = self.draft.step;
        self.validate_step(current).into_result(current)?;
        if let Some(next) = current.next() {
            self.draft.step = next;
        }
        Ok(self.draft.step)
    }

    /// Go back one step. Never validates.
    pub fn back(&mut self) -> WizardStep {
        if let Some(prev) = self.draft.step.prev() {
            self.draft.step = prev;
        }
        self.draft.step
    }

    /// Jump to `target`. Backward jumps are free; forward jumps must not
    /// skip over a step that fails validation.
    pub fn go_to(&mut self, target: WizardStep) -> Result<WizardStep, ValidationError> {
        if target > self.draft.step {
            for step in WizardStep::ALL
                .iter()
                .filter(|s| **s >= self.draft.step && **s < target)
            {
                self.validate_step(*step).into_result(*step)?;
            }
        }
        self.draft.step = target;
        Ok(target)
    }

    /// Validate every gated step and freeze the draft for final submit.
    pub fn submission(&self) -> Result<Submission, ValidationError> {
        for step in WizardStep::ALL.iter().filter(|s| s.is_gated()) {
            self.validate_step(*step).into_result(*step)?;
        }
        let d = &self.draft;
        Ok(Submission {
            request: RegistrationRequest::new(
                d.email.clone(),
                d.password.expose_secret(),
                d.phone.clone(),
                d.owner_name.clone(),
                Role::Gym,
            ),
            draft: d.clone(),
        })
    }

    /// Gated-step check for a draft handed to provisioning. The password is
    /// not required: it is gone once the identity has been verified.
    pub fn provisioning_readiness(&self) -> Result<(), ValidationError> {
        let mut details = self.validate_step(WizardStep::BusinessDetails);
        details.missing_fields.retain(|f| *f != DraftField::Password);
        details.ok = details.missing_fields.is_empty();
        details.into_result(WizardStep::BusinessDetails)?;
        self.validate_step(WizardStep::Documents)
            .into_result(WizardStep::Documents)
    }

    fn missing_business_details(&self) -> Vec<DraftField> {
        let d = &self.draft;
        let text_fields = [
            (DraftField::BusinessName, d.business_name.as_str()),
            (DraftField::OwnerName, d.owner_name.as_str()),
            (DraftField::Email, d.email.as_str()),
            (DraftField::Phone, d.phone.as_str()),
            (DraftField::Password, d.password.expose_secret()),
            (DraftField::Description, d.description.as_str()),
            (DraftField::Slogan, d.slogan.as_str()),
        ];

        let mut missing: Vec<DraftField> = text_fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(field, _)| *field)
            .collect();

        if d.capacity.unwrap_or(0) == 0 {
            missing.push(DraftField::Capacity);
        }

        for (field, value) in [
            (DraftField::OpenTime, &d.open_time),
            (DraftField::CloseTime, &d.close_time),
            (DraftField::Address, &d.address),
        ] {
            if value.trim().is_empty() {
                missing.push(field);
            }
        }

        if !d.has_valid_coordinates() {
            missing.push(DraftField::Coordinates);
        }
        missing
    }

    fn missing_documents(&self) -> Vec<DraftField> {
        let mut missing = Vec::new();
        if !self.draft.has_document(PAN_DOCUMENT_SLOT) {
            missing.push(DraftField::PanDocument);
        }
        if !self.draft.has_document(OWNER_ID_DOCUMENT_SLOT) {
            missing.push(DraftField::OwnerIdDocument);
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Step-1 required fields in reporting order.
    const STEP_ONE_FIELDS: [DraftField; 12] = [
        DraftField::BusinessName,
        DraftField::OwnerName,
        DraftField::Email,
        DraftField::Phone,
        DraftField::Password,
        DraftField::Description,
        DraftField::Slogan,
        DraftField::Capacity,
        DraftField::OpenTime,
        DraftField::CloseTime,
        DraftField::Address,
        DraftField::Coordinates,
    ];

    fn complete_step_one() -> DraftPatch {
        DraftPatch::default()
            .business_name("Iron Temple")
            .owner_name("Ravi Kumar")
            .email("ravi@irontemple.test")
            .phone("+91 98765 43210")
            .password("correct-horse")
            .description("Strength gym in Dwarka")
            .slogan("Lift more")
            .capacity(120)
            .hours("06:00", "22:00")
            .address("Sector 7, Dwarka, New Delhi")
            .coordinates(vec![77.10, 28.60])
    }

    /// Blank out one step-1 field on a complete patch.
    fn clear(patch: DraftPatch, field: DraftField) -> DraftPatch {
        let mut p = patch;
        match field {
            DraftField::BusinessName => p.business_name = Some(String::new()),
            DraftField::OwnerName => p.owner_name = Some("   ".into()),
            DraftField::Email => p.email = Some(String::new()),
            DraftField::Phone => p.phone = Some(String::new()),
            DraftField::Password => p.password = None,
            DraftField::Description => p.description = Some(String::new()),
            DraftField::Slogan => p.slogan = Some(String::new()),
            DraftField::Capacity => p.capacity = None,
            DraftField::OpenTime => p.open_time = Some(String::new()),
            DraftField::CloseTime => p.close_time = Some(String::new()),
            DraftField::Address => p.address = Some(String::new()),
            DraftField::Coordinates => p.coordinates = Some(vec![77.10]),
            DraftField::PanDocument | DraftField::OwnerIdDocument => {}
        }
        p
    }

    #[test]
    fn every_missing_subset_is_reported_exactly() {
        for mask in 0u32..(1 << STEP_ONE_FIELDS.len()) {
            let expected: Vec<DraftField> = STEP_ONE_FIELDS
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, f)| *f)
                .collect();

            let patch = expected
                .iter()
                .fold(complete_step_one(), |p, f| clear(p, *f));
            let mut wizard = WizardStateManager::new();
            wizard.update_field(patch);

            let result = wizard.validate_step(WizardStep::BusinessDetails);
            assert_eq!(result.ok, expected.is_empty(), "mask {mask:#b}");
            assert_eq!(result.missing_fields, expected, "mask {mask:#b}");
        }
    }

    #[test]
    fn coordinates_length_decides_step_one() {
        for (coords, ok) in [
            (vec![], false),
            (vec![77.10], false),
            (vec![77.10, 28.60], true),
        ] {
            let mut wizard = WizardStateManager::new();
            wizard.update_field(complete_step_one().coordinates(coords));
            assert_eq!(wizard.validate_step(WizardStep::BusinessDetails).ok, ok);
        }
    }

    #[test]
    fn middle_steps_have_no_gate() {
        let wizard = WizardStateManager::new();
        for step in [WizardStep::Category, WizardStep::Facilities, WizardStep::Photos] {
            assert!(wizard.validate_step(step).ok);
        }
    }

    #[test]
    fn documents_step_requires_both_mandatory_slots() {
        let mut wizard = WizardStateManager::new();
        assert_eq!(
            wizard.validate_step(WizardStep::Documents).missing_fields,
            vec![DraftField::PanDocument, DraftField::OwnerIdDocument]
        );

        wizard.update_field(DraftPatch::default().document(PAN_DOCUMENT_SLOT, "https://cdn/pan.pdf"));
        assert_eq!(
            wizard.validate_step(WizardStep::Documents).missing_fields,
            vec![DraftField::OwnerIdDocument]
        );

        wizard.update_field(
            DraftPatch::default().document(OWNER_ID_DOCUMENT_SLOT, "https://cdn/aadhaar.pdf"),
        );
        assert!(wizard.validate_step(WizardStep::Documents).ok);
    }

    #[test]
    fn next_is_blocked_with_named_fields() {
        let mut wizard = WizardStateManager::new();
        wizard.update_field(clear(complete_step_one(), DraftField::Slogan));

        let err = wizard.next().unwrap_err();
        assert_eq!(err.step, 1);
        assert_eq!(err.missing, vec![DraftField::Slogan]);
        assert_eq!(wizard.current_step(), WizardStep::BusinessDetails);
    }

    #[test]
    fn navigation_is_reversible() {
        let mut wizard = WizardStateManager::new();
        wizard.update_field(complete_step_one());

        assert_eq!(wizard.next().unwrap(), WizardStep::Category);
        assert_eq!(wizard.next().unwrap(), WizardStep::Facilities);
        assert_eq!(wizard.back(), WizardStep::Category);
        assert_eq!(wizard.back(), WizardStep::BusinessDetails);
        assert_eq!(wizard.back(), WizardStep::BusinessDetails);

        // Editing after going back keeps later data intact.
        wizard.update_field(DraftPatch::default().slogan("Lift heavier"));
        assert_eq!(wizard.go_to(WizardStep::Photos).unwrap(), WizardStep::Photos);
        assert_eq!(wizard.draft().slogan, "Lift heavier");
    }

    #[test]
    fn go_to_cannot_skip_an_invalid_step() {
        let mut wizard = WizardStateManager::new();
        let err = wizard.go_to(WizardStep::Documents).unwrap_err();
        assert_eq!(err.step, 1);
        assert_eq!(wizard.current_step(), WizardStep::BusinessDetails);
    }

    #[test]
    fn submission_checks_every_gated_step() {
        let mut wizard = WizardStateManager::new();
        wizard.update_field(complete_step_one());
        wizard.go_to(WizardStep::Documents).unwrap();

        let err = wizard.submission().unwrap_err();
        assert_eq!(err.step, 5);

        wizard.update_field(
            DraftPatch::default()
                .document(PAN_DOCUMENT_SLOT, "https://cdn/pan.pdf")
                .document(OWNER_ID_DOCUMENT_SLOT, "https://cdn/id.pdf"),
        );
        let submission = wizard.submission().unwrap();
        assert_eq!(submission.request.role, Role::Gym);
        assert_eq!(submission.request.email, submission.draft.email);
        assert_eq!(submission.request.display_name, submission.draft.owner_name);
        assert_eq!(submission.draft.documents.len(), 2);
    }

    #[test]
    fn provisioning_readiness_ignores_the_password() {
        let mut patch = complete_step_one()
            .document(PAN_DOCUMENT_SLOT, "https://cdn/pan.pdf")
            .document(OWNER_ID_DOCUMENT_SLOT, "https://cdn/id.pdf");
        patch.password = None;
        let mut wizard = WizardStateManager::new();
        wizard.update_field(patch);

        assert!(wizard.submission().is_err());
        assert!(wizard.provisioning_readiness().is_ok());

        wizard.update_field(DraftPatch::default().document(PAN_DOCUMENT_SLOT, ""));
        let err = wizard.provisioning_readiness().unwrap_err();
        assert_eq!(err.step, 5);
        assert_eq!(err.missing, vec![DraftField::PanDocument]);
    }

    #[test]
    fn validate_step_index_rejects_out_of_range() {
        let wizard = WizardStateManager::new();
        assert!(wizard.validate_step_index(0).is_none());
        assert!(wizard.validate_step_index(3).unwrap().ok);
    }
}
