//! Registration draft and partial-update patches.

use std::collections::{BTreeMap, BTreeSet};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::step::WizardStep;

/// Document slot holding the PAN card (tax identity) scan.
pub const PAN_DOCUMENT_SLOT: &str = "pan_card";
/// Document slot holding the owner's identity proof.
pub const OWNER_ID_DOCUMENT_SLOT: &str = "owner_id_proof";

/// A field the wizard can require.
///
/// Serialized names match the keys the client sends in a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftField {
    BusinessName,
    OwnerName,
    Email,
    Phone,
    Password,
    Description,
    Slogan,
    Capacity,
    OpenTime,
    CloseTime,
    Address,
    Coordinates,
    PanDocument,
    OwnerIdDocument,
}

impl DraftField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BusinessName => "business_name",
            Self::OwnerName => "owner_name",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Password => "password",
            Self::Description => "description",
            Self::Slogan => "slogan",
            Self::Capacity => "capacity",
            Self::OpenTime => "open_time",
            Self::CloseTime => "close_time",
            Self::Address => "address",
            Self::Coordinates => "coordinates",
            Self::PanDocument => "pan_document",
            Self::OwnerIdDocument => "owner_id_document",
        }
    }
}

impl std::fmt::Display for DraftField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The in-progress partner registration, owned by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationDraft {
    // Identity
    pub owner_name: String,
    pub email: String,
    pub phone: String,
    /// Held only while the wizard is open; never serialized.
    #[serde(skip_serializing, default)]
    pub password: SecretString,

    // Business
    pub business_name: String,
    pub description: String,
    pub slogan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    pub open_time: String,
    pub close_time: String,
    pub address: String,
    /// `[longitude, latitude]`.
    #[serde(default)]
    pub coordinates: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub facilities: BTreeSet<String>,

    /// Named photo slots → uploaded URL.
    #[serde(default)]
    pub media: BTreeMap<String, String>,
    /// Named document slots → uploaded URL.
    #[serde(default)]
    pub documents: BTreeMap<String, String>,

    #[serde(default)]
    pub step: WizardStep,
}

impl RegistrationDraft {
    /// Whether `coordinates` is a finite `[lng, lat]` pair.
    pub fn has_valid_coordinates(&self) -> bool {
        self.coordinates.len() == 2 && self.coordinates.iter().all(|c| c.is_finite())
    }

    /// Whether a document slot holds a non-blank URL.
    pub fn has_document(&self, slot: &str) -> bool {
        self.documents
            .get(slot)
            .is_some_and(|url| !url.trim().is_empty())
    }

    /// Copy of the draft safe to persist outside the wizard (no password).
    pub fn snapshot(&self) -> Self {
        Self {
            password: SecretString::default(),
            ..self.clone()
        }
    }
}

/// A partial update to a [`RegistrationDraft`].
///
/// Unset fields are left alone. Media and document entries are merged slot by
/// slot; an empty URL clears the slot. `facilities` replaces the whole set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DraftPatch {
    pub owner_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub password: Option<SecretString>,
    pub business_name: Option<String>,
    pub description: Option<String>,
    pub slogan: Option<String>,
    pub capacity: Option<u32>,
    pub open_time: Option<String>,
    pub close_time: Option<String>,
    pub address: Option<String>,
    pub coordinates: Option<Vec<f64>>,
    pub category: Option<String>,
    pub facilities: Option<BTreeSet<String>>,
    pub media: BTreeMap<String, String>,
    pub documents: BTreeMap<String, String>,
}

impl DraftPatch {
    pub fn owner_name(mut self, v: impl Into<String>) -> Self {
        self.owner_name = Some(v.into());
        self
    }

    pub fn email(mut self, v: impl Into<String>) -> Self {
        self.email = Some(v.into());
        self
    }

    pub fn phone(mut self, v: impl Into<String>) -> Self {
        self.phone = Some(v.into());
        self
    }

    pub fn password(mut self, v: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(v.into()));
        self
    }

    pub fn business_name(mut self, v: impl Into<String>) -> Self {
        self.business_name = Some(v.into());
        self
    }

    pub fn description(mut self, v: impl Into<String>) -> Self {
        self.description = Some(v.into());
        self
    }

    pub fn slogan(mut self, v: impl Into<String>) -> Self {
        self.slogan = Some(v.into());
        self
    }

    pub fn capacity(mut self, v: u32) -> Self {
        self.capacity = Some(v);
        self
    }

    pub fn hours(mut self, open: impl Into<String>, close: impl Into<String>) -> Self {
        self.open_time = Some(open.into());
        self.close_time = Some(close.into());
        self
    }

    pub fn address(mut self, v: impl Into<String>) -> Self {
        self.address = Some(v.into());
        self
    }

    pub fn coordinates(mut self, v: Vec<f64>) -> Self {
        self.coordinates = Some(v);
        self
    }

    pub fn category(mut self, v: impl Into<String>) -> Self {
        self.category = Some(v.into());
        self
    }

    pub fn facilities<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facilities = Some(items.into_iter().map(Into::into).collect());
        self
    }

    pub fn media(mut self, slot: impl Into<String>, url: impl Into<String>) -> Self {
        self.media.insert(slot.into(), url.into());
        self
    }

    pub fn document(mut self, slot: impl Into<String>, url: impl Into<String>) -> Self {
        self.documents.insert(slot.into(), url.into());
        self
    }

    /// Apply this patch onto `draft`.
    pub(crate) fn apply(self, draft: &mut RegistrationDraft) {
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *target = v;
            }
        }

        set(&mut draft.owner_name, self.owner_name);
        set(&mut draft.email, self.email);
        set(&mut draft.phone, self.phone);
        set(&mut draft.password, self.password);
        set(&mut draft.business_name, self.business_name);
        set(&mut draft.description, self.description);
        set(&mut draft.slogan, self.slogan);
        set(&mut draft.open_time, self.open_time);
        set(&mut draft.close_time, self.close_time);
        set(&mut draft.address, self.address);
        set(&mut draft.coordinates, self.coordinates);
        set(&mut draft.facilities, self.facilities);
        if self.capacity.is_some() {
            draft.capacity = self.capacity;
        }
        if self.category.is_some() {
            draft.category = self.category;
        }

        merge_slots(&mut draft.media, self.media);
        merge_slots(&mut draft.documents, self.documents);
    }
}

fn merge_slots(slots: &mut BTreeMap<String, String>, patch: BTreeMap<String, String>) {
    for (slot, url) in patch {
        if url.trim().is_empty() {
            slots.remove(&slot);
        } else {
            slots.insert(slot, url);
        }
    }
}
