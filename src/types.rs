use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type NoteId = String;
pub type PluginId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    pub body: String,
    pub locked: bool,
    pub protected: bool,
    pub trashed: bool,
    /// Has local changes not yet pushed by the sync engine.
    pub dirty: bool,
    pub spellcheck: bool,
    /// Unix ms of the last user-initiated modification.
    pub user_modified: i64,
    pub last_sync_began: Option<i64>,
    pub last_sync_end: Option<i64>,
}

impl Note {
    pub fn new(id: impl Into<NoteId>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            locked: false,
            protected: false,
            trashed: false,
            dirty: false,
            spellcheck: true,
            user_modified: 0,
            last_sync_began: None,
            last_sync_end: None,
        }
    }

    /// A fresh, not-yet-persisted note with a 32-char hex id.
    pub fn template() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), "", "")
    }
}

/// Where a note mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSource {
    LocalEdit,
    RetrievedFromStorage,
    LocalInsert,
}

impl ChangeSource {
    pub fn is_retrieved(self) -> bool {
        matches!(self, ChangeSource::RetrievedFromStorage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteChange {
    pub note: Note,
    pub source: ChangeSource,
}

/// Sync lifecycle signals published by the storage/sync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppEvent {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    HighLatency,
    LocalWriteError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionEvent {
    UnprotectedSessionBegan,
    UnprotectedSessionExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginArea {
    Editor,
    StackItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: PluginId,
    pub name: String,
    pub area: PluginArea,
    pub active: bool,
    /// Notes this plugin has been explicitly enabled for.
    #[serde(default)]
    pub enabled_notes: BTreeSet<NoteId>,
}

impl PluginDescriptor {
    pub fn new(id: impl Into<PluginId>, name: impl Into<String>, area: PluginArea) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            area,
            active: true,
            enabled_notes: BTreeSet::new(),
        }
    }

    pub fn is_explicitly_enabled_for(&self, note_id: &str) -> bool {
        self.enabled_notes.contains(note_id)
    }
}

/// Whether a plugin-set change was caused by this application's own writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginChangeSource {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSetChange {
    pub source: PluginChangeSource,
}

/// Opaque address of a live plugin view. Holding one grants no ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewHandle(pub u64);

impl fmt::Display for ViewHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditField {
    Title,
    Body,
}

/// Extra mutation applied by the store alongside a title/body write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteMutation {
    Trash,
    SetLocked(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub title: String,
    pub body: String,
    pub bypass_debounce: bool,
    /// Title-only edits don't need list previews regenerated.
    pub skip_preview_update: bool,
    pub mutation: Option<NoteMutation>,
}

impl SaveRequest {
    pub fn edit(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            bypass_debounce: false,
            skip_preview_update: false,
            mutation: None,
        }
    }

    pub fn urgent(mut self) -> Self {
        self.bypass_debounce = true;
        self
    }

    pub fn without_preview_update(mut self) -> Self {
        self.skip_preview_update = true;
        self
    }

    pub fn with_mutation(mut self, mutation: NoteMutation) -> Self {
        self.mutation = Some(mutation);
        self
    }

    /// Two requests can be folded into one unless they carry different mutations.
    pub fn can_merge(&self, newer: &SaveRequest) -> bool {
        self.mutation.is_none() || newer.mutation.is_none() || self.mutation == newer.mutation
    }

    /// Fold a newer request into this one: latest title/body win, a pending
    /// mutation survives unless the newer request brings its own. Only valid
    /// when [`SaveRequest::can_merge`] holds.
    pub fn merge(self, newer: SaveRequest) -> SaveRequest {
        SaveRequest {
            title: newer.title,
            body: newer.body,
            bypass_debounce: newer.bypass_debounce,
            skip_preview_update: self.skip_preview_update && newer.skip_preview_update,
            mutation: newer.mutation.or(self.mutation),
        }
    }

    pub fn same_payload(&self, other: &SaveRequest) -> bool {
        self.title == other.title && self.body == other.body
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDisplay {
    pub message: String,
    pub description: Option<String>,
    pub is_error: bool,
    pub is_slow: bool,
}

impl StatusDisplay {
    pub fn saving() -> Self {
        Self::info("Saving…")
    }

    pub fn saved(has_account: bool) -> Self {
        if has_account {
            Self::info("All changes saved")
        } else {
            Self::info("All changes saved offline")
        }
    }

    pub fn sync_unreachable() -> Self {
        Self::error("Sync Unreachable", "Changes saved offline")
    }

    pub fn offline_saving_issue() -> Self {
        Self::error("Offline Saving Issue", "Changes not saved")
    }

    fn info(message: &str) -> Self {
        Self {
            message: message.to_string(),
            description: None,
            is_error: false,
            is_slow: false,
        }
    }

    fn error(message: &str, description: &str) -> Self {
        Self {
            message: message.to_string(),
            description: Some(description.to_string()),
            is_error: true,
            is_slow: false,
        }
    }
}

/// Read-only view of a session, published to the view layer on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub note_id: NoteId,
    pub title: String,
    pub body: String,
    pub status: Option<StatusDisplay>,
    pub sync_slow: bool,
    pub locked: bool,
    pub is_template: bool,
    pub spellcheck: bool,
    pub editor_view: Option<ViewHandle>,
    pub stack_views: Vec<ViewHandle>,
    pub protection_hidden: bool,
    pub closed: bool,
}
