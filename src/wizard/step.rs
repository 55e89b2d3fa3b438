//! Wizard step cursor — the five screens of partner registration.

use serde::{Deserialize, Serialize};

/// The ordered steps of the registration wizard.
///
/// Serialized as the 1-based step index the client shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum WizardStep {
    /// Owner identity, business details, hours, address and map pin.
    BusinessDetails,
    Category,
    Facilities,
    Photos,
    /// Compliance documents; the final submit happens here.
    Documents,
}

impl WizardStep {
    pub const ALL: [WizardStep; 5] = [
        WizardStep::BusinessDetails,
        WizardStep::Category,
        WizardStep::Facilities,
        WizardStep::Photos,
        WizardStep::Documents,
    ];

    /// 1-based index of this step.
    pub fn index(&self) -> u8 {
        match self {
            Self::BusinessDetails => 1,
            Self::Category => 2,
            Self::Facilities => 3,
            Self::Photos => 4,
            Self::Documents => 5,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index).checked_sub(1)?).copied()
    }

    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn prev(&self) -> Option<Self> {
        Self::from_index(self.index() - 1)
    }

    /// Whether leaving this step requires its fields to validate.
    pub fn is_gated(&self) -> bool {
        matches!(self, Self::BusinessDetails | Self::Documents)
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Self::Documents)
    }
}

impl Default for WizardStep {
    fn default() -> Self {
        Self::BusinessDetails
    }
}

impl From<WizardStep> for u8 {
    fn from(step: WizardStep) -> Self {
        step.index()
    }
}

impl TryFrom<u8> for WizardStep {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(value).ok_or_else(|| format!("wizard step must be 1-5, got {value}"))
    }
}

impl std::fmt::Display for WizardStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BusinessDetails => "business_details",
            Self::Category => "category",
            Self::Facilities => "facilities",
            Self::Photos => "photos",
            Self::Documents => "documents",
        };
        write!(f, "{s}")
    }
}
