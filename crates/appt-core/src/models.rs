//! Appointment data model shared by every store and engine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of calendar a record lives in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One per user, authoritative for that user's appointments
    #[default]
    Private,
    /// Shared between partnered users, holds mirrors
    Shared,
    /// Fed by inbound business email
    Business,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
            Self::Business => "business",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication state of a private appointment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No mirror exists
    #[default]
    Unsynced,
    /// A sync task is executing against this record
    Syncing,
    /// Mirror exists and both tracking identities are set
    Synced,
    /// Retries were exhausted; stays here until the next edit or explicit re-sync
    SyncFailed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsynced => "unsynced",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::SyncFailed => "sync_failed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unsynced" | "" => Ok(Self::Unsynced),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "sync_failed" | "syncfailed" => Ok(Self::SyncFailed),
            other => Err(format!("unknown sync state: {}", other)),
        }
    }
}

/// Typed view of the tracking attributes stored on store-native records
///
/// Private records use `synced_peer_id` and `sync_state`. Mirrors in the
/// shared store carry `source_user_id` and `source_private_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TrackingFields {
    /// Identity of this record's mirror in the shared store
    #[serde(default)]
    pub synced_peer_id: Option<String>,
    /// Owner of the private record a mirror was produced from
    #[serde(default)]
    pub source_user_id: Option<String>,
    /// Identity of the private record a mirror was produced from
    #[serde(default)]
    pub source_private_id: Option<String>,
    /// Replication state marker
    #[serde(default)]
    pub sync_state: SyncState,
}

impl TrackingFields {
    /// Tracking fields for a mirror produced from `private_id` owned by `user_id`
    pub fn mirror_of(user_id: impl Into<String>, private_id: impl Into<String>) -> Self {
        Self {
            synced_peer_id: None,
            source_user_id: Some(user_id.into()),
            source_private_id: Some(private_id.into()),
            sync_state: SyncState::Unsynced,
        }
    }

    /// Whether this record was produced by the sync engine.
    /// Human-entered shared records lack the source fields.
    pub fn is_engine_mirror(&self) -> bool {
        self.source_user_id.is_some() && self.source_private_id.is_some()
    }
}

/// A calendar appointment as held by any store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    /// External identity assigned by the store on create
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Flagged for visibility to the partnered user via the shared store
    #[serde(default)]
    pub partner_relevant: bool,
    /// Store the record lives in
    #[serde(default)]
    pub origin: StoreKind,
    #[serde(default)]
    pub tracking: TrackingFields,
    /// Set by the store on create
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Appointment {
    /// Create a new private appointment
    pub fn new(
        title: impl Into<String>,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            id: None,
            title: title.into(),
            start,
            end,
            description: None,
            location: None,
            tags: Vec::new(),
            partner_relevant: false,
            origin: StoreKind::Private,
            tracking: TrackingFields::default(),
            created_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_partner_relevant(mut self, partner_relevant: bool) -> Self {
        self.partner_relevant = partner_relevant;
        self
    }

    pub fn with_origin(mut self, origin: StoreKind) -> Self {
        self.origin = origin;
        self
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Build the shared-store mirror of this private record.
    ///
    /// Content is copied, tracking points back at the owner and the origin.
    pub fn to_mirror(&self, user_id: &str, private_id: &str) -> Self {
        Self {
            id: None,
            title: self.title.clone(),
            start: self.start,
            end: self.end,
            description: self.description.clone(),
            location: self.location.clone(),
            tags: self.tags.clone(),
            partner_relevant: true,
            origin: StoreKind::Shared,
            tracking: TrackingFields::mirror_of(user_id, private_id),
            created_at: None,
        }
    }

    /// Whether the user-visible fields differ from `other`
    pub fn content_differs(&self, other: &Appointment) -> bool {
        self.title != other.title
            || self.start != other.start
            || self.end != other.end
            || self.description != other.description
            || self.location != other.location
            || self.tags != other.tags
    }
}

/// Partial update applied by a store's `update`
///
/// `None` leaves a field untouched. Double options clear a field with `Some(None)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub title: Option<String>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub description: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub partner_relevant: Option<bool>,
    pub synced_peer_id: Option<Option<String>>,
    pub sync_state: Option<SyncState>,
}

impl AppointmentPatch {
    /// Patch that rewrites every content field from `source`
    pub fn content_from(source: &Appointment) -> Self {
        Self {
            title: Some(source.title.clone()),
            start: Some(source.start),
            end: Some(source.end),
            description: Some(source.description.clone()),
            location: Some(source.location.clone()),
            tags: Some(source.tags.clone()),
            ..Default::default()
        }
    }

    /// Patch touching only the sync-state marker
    pub fn sync_state(state: SyncState) -> Self {
        Self {
            sync_state: Some(state),
            ..Default::default()
        }
    }

    /// Patch writing the mirror identity back onto a private record
    pub fn link_peer(peer_id: impl Into<String>) -> Self {
        Self {
            synced_peer_id: Some(Some(peer_id.into())),
            sync_state: Some(SyncState::Synced),
            ..Default::default()
        }
    }

    /// Patch clearing the mirror identity from a private record
    pub fn unlink_peer() -> Self {
        Self {
            synced_peer_id: Some(None),
            sync_state: Some(SyncState::Unsynced),
            ..Default::default()
        }
    }

    pub fn with_partner_relevant(mut self, partner_relevant: bool) -> Self {
        self.partner_relevant = Some(partner_relevant);
        self
    }

    /// Whether any user-visible field is touched
    pub fn touches_content(&self) -> bool {
        self.title.is_some()
            || self.start.is_some()
            || self.end.is_some()
            || self.description.is_some()
            || self.location.is_some()
            || self.tags.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.touches_content()
            && self.partner_relevant.is_none()
            && self.synced_peer_id.is_none()
            && self.sync_state.is_none()
    }

    /// Apply the patch in place
    pub fn apply(&self, appointment: &mut Appointment) {
        if let Some(title) = &self.title {
            appointment.title = title.clone();
        }
        if let Some(start) = self.start {
            appointment.start = start;
        }
        if let Some(end) = self.end {
            appointment.end = end;
        }
        if let Some(description) = &self.description {
            appointment.description = description.clone();
        }
        if let Some(location) = &self.location {
            appointment.location = location.clone();
        }
        if let Some(tags) = &self.tags {
            appointment.tags = tags.clone();
        }
        if let Some(partner_relevant) = self.partner_relevant {
            appointment.partner_relevant = partner_relevant;
        }
        if let Some(peer) = &self.synced_peer_id {
            appointment.tracking.synced_peer_id = peer.clone();
        }
        if let Some(state) = self.sync_state {
            appointment.tracking.sync_state = state;
        }
    }
}
