//! Interfaces of the collaborators a note session drives: storage/sync,
//! the plugin host, re-authorization and the wall clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;

use crate::events::{Callback, Listeners, Subscription};
use crate::types::{
    AppEvent, Note, NoteChange, PluginArea, PluginDescriptor, PluginSetChange, ProtectionEvent,
    SaveRequest, ViewHandle,
};

/// Note storage and sync engine. Must serialize writes per note.
#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn get_note(&self, id: &str) -> Result<Option<Note>>;

    /// Persist title/body (plus an optional mutation) and return the stored note.
    async fn save_note(&self, id: &str, request: &SaveRequest) -> Result<Note>;

    /// Materialize a template note. Inserting an id that already exists is a no-op.
    async fn insert_note(&self, note: &Note) -> Result<Note>;

    async fn delete_note(&self, note: &Note) -> Result<()>;

    /// False when no sync account is configured (changes only live locally).
    fn has_account(&self) -> bool;

    fn subscribe_note(&self, note_id: &str, callback: Callback<NoteChange>) -> Subscription;

    fn subscribe_events(&self, callback: Callback<AppEvent>) -> Subscription;
}

/// Creates and destroys sandboxed plugin views.
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn create_view(&self, plugin: &PluginDescriptor, note_id: &str) -> Result<ViewHandle>;

    async fn destroy_view(&self, handle: ViewHandle) -> Result<()>;

    fn list_plugins(&self, area: PluginArea) -> Vec<PluginDescriptor>;

    /// Editor plugin chosen for the note; `None` means the built-in text editor.
    fn editor_for_note(&self, note: &Note) -> Option<PluginDescriptor>;

    async fn set_enabled_for_note(&self, plugin_id: &str, note_id: &str, enabled: bool) -> Result<()>;

    fn subscribe(&self, callback: Callback<PluginSetChange>) -> Subscription;
}

/// Re-authorization for protected notes.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// True while the user has an active session that bypasses protection.
    fn has_unprotected_session(&self) -> bool;

    async fn authorize(&self, note: &Note) -> Result<bool>;

    fn subscribe(&self, callback: Callback<ProtectionEvent>) -> Subscription;
}

pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds.
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        unix_ms()
    }
}

pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn NoteStore>,
    pub plugins: Arc<dyn PluginHost>,
    pub auth: Arc<dyn Authorizer>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn new(
        store: Arc<dyn NoteStore>,
        plugins: Arc<dyn PluginHost>,
        auth: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            store,
            plugins,
            auth,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Authorizer with a fixed answer, for headless use.
pub struct StaticAuthorizer {
    grant: bool,
    unprotected: AtomicBool,
    listeners: Listeners<ProtectionEvent>,
}

impl StaticAuthorizer {
    pub fn new(grant: bool) -> Self {
        Self {
            grant,
            unprotected: AtomicBool::new(false),
            listeners: Listeners::new(),
        }
    }

    pub fn begin_unprotected_session(&self) {
        self.unprotected.store(true, Ordering::SeqCst);
        self.listeners.emit(&ProtectionEvent::UnprotectedSessionBegan);
    }

    pub fn expire_unprotected_session(&self) {
        self.unprotected.store(false, Ordering::SeqCst);
        self.listeners.emit(&ProtectionEvent::UnprotectedSessionExpired);
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    fn has_unprotected_session(&self) -> bool {
        self.unprotected.load(Ordering::SeqCst)
    }

    async fn authorize(&self, _note: &Note) -> Result<bool> {
        Ok(self.grant)
    }

    fn subscribe(&self, callback: Callback<ProtectionEvent>) -> Subscription {
        self.listeners.subscribe(callback)
    }
}
