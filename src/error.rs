use thiserror::Error;

use crate::types::NoteId;

/// Caller-visible failures of a note session.
///
/// Persistence and plugin-host failures that happen in the background are
/// absorbed by the session (status display, empty view slot); these variants
/// only reach callers of commands that asked for the operation directly.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A change event for another note reached this session. Caller bug.
    #[error("change for note {received} delivered to session of note {expected}")]
    WrongNote { expected: NoteId, received: NoteId },

    #[error("failed to persist note {note_id}: {reason}")]
    Persistence { note_id: NoteId, reason: String },

    #[error("re-authorization declined for note {0}")]
    AuthorizationDenied(NoteId),

    #[error("plugin host failed for {plugin}: {reason}")]
    PluginHost { plugin: String, reason: String },

    #[error("note has not been saved yet")]
    TemplateNote,

    #[error("note is locked")]
    NoteLocked,

    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn persistence(note_id: &str, err: &anyhow::Error) -> Self {
        SessionError::Persistence {
            note_id: note_id.to_string(),
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn plugin_host(plugin: &str, err: &anyhow::Error) -> Self {
        SessionError::PluginHost {
            plugin: plugin.to_string(),
            reason: format!("{err:#}"),
        }
    }
}
