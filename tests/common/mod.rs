#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use note_session::events::Callback;
use note_session::{
    AppEvent, Authorizer, ChangeSource, Clock, Listeners, Note, NoteChange, NoteMutation,
    NoteStore, PluginArea, PluginDescriptor, ProtectionEvent, SaveRequest, Services,
    SessionConfig, StaticPluginHost, Subscription,
};

/// In-memory store that records every call the session makes.
pub struct MemoryStore {
    notes: Mutex<HashMap<String, Note>>,
    saves: Mutex<Vec<SaveRequest>>,
    inserted: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    save_delay: Mutex<Duration>,
    fail_saves: AtomicBool,
    has_account: bool,
    note_listeners: Listeners<NoteChange>,
    event_listeners: Listeners<AppEvent>,
}

impl MemoryStore {
    pub fn new(has_account: bool) -> Self {
        Self {
            notes: Mutex::new(HashMap::new()),
            saves: Mutex::new(Vec::new()),
            inserted: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            save_delay: Mutex::new(Duration::ZERO),
            fail_saves: AtomicBool::new(false),
            has_account,
            note_listeners: Listeners::new(),
            event_listeners: Listeners::new(),
        }
    }

    pub fn with_note(self, note: Note) -> Self {
        self.notes.lock().unwrap().insert(note.id.clone(), note);
        self
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saves(&self) -> Vec<SaveRequest> {
        self.saves.lock().unwrap().clone()
    }

    pub fn inserted(&self) -> Vec<String> {
        self.inserted.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn stored(&self, id: &str) -> Option<Note> {
        self.notes.lock().unwrap().get(id).cloned()
    }

    pub fn emit_event(&self, event: AppEvent) {
        self.event_listeners.emit(&event);
    }

    pub fn emit_change(&self, note: Note, source: ChangeSource) {
        self.note_listeners.emit(&NoteChange { note, source });
    }

    /// Pretend a sync round finished for the note.
    pub fn complete_sync(&self, id: &str, began: i64, ended: i64) {
        let note = {
            let mut notes = self.notes.lock().unwrap();
            let Some(note) = notes.get_mut(id) else {
                return;
            };
            note.last_sync_began = Some(began);
            note.last_sync_end = Some(ended);
            note.dirty = false;
            note.clone()
        };
        self.emit_change(note, ChangeSource::LocalEdit);
    }
}

#[async_trait]
impl NoteStore for MemoryStore {
    async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        Ok(self.stored(id))
    }

    async fn save_note(&self, id: &str, request: &SaveRequest) -> Result<Note> {
        self.saves.lock().unwrap().push(request.clone());
        let delay = *self.save_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let note = {
            let mut notes = self.notes.lock().unwrap();
            let note = notes.get_mut(id).ok_or_else(|| anyhow!("note {id} not found"))?;
            note.title = request.title.clone();
            note.body = request.body.clone();
            note.dirty = true;
            match request.mutation {
                Some(NoteMutation::Trash) => note.trashed = true,
                Some(NoteMutation::SetLocked(locked)) => note.locked = locked,
                None => {}
            }
            note.clone()
        };
        self.emit_change(note.clone(), ChangeSource::LocalEdit);
        Ok(note)
    }

    async fn insert_note(&self, note: &Note) -> Result<Note> {
        let inserted = {
            let mut notes = self.notes.lock().unwrap();
            if let Some(existing) = notes.get(&note.id) {
                return Ok(existing.clone());
            }
            let mut inserted = note.clone();
            inserted.dirty = true;
            notes.insert(inserted.id.clone(), inserted.clone());
            inserted
        };
        self.inserted.lock().unwrap().push(note.id.clone());
        self.emit_change(inserted.clone(), ChangeSource::LocalInsert);
        Ok(inserted)
    }

    async fn delete_note(&self, note: &Note) -> Result<()> {
        self.notes
            .lock()
            .unwrap()
            .remove(&note.id)
            .ok_or_else(|| anyhow!("note {} not found", note.id))?;
        self.deleted.lock().unwrap().push(note.id.clone());
        Ok(())
    }

    fn has_account(&self) -> bool {
        self.has_account
    }

    fn subscribe_note(&self, note_id: &str, callback: Callback<NoteChange>) -> Subscription {
        let note_id = note_id.to_string();
        self.note_listeners.subscribe(move |change: &NoteChange| {
            if change.note.id == note_id {
                callback(change);
            }
        })
    }

    fn subscribe_events(&self, callback: Callback<AppEvent>) -> Subscription {
        self.event_listeners.subscribe(callback)
    }
}

/// Authorizer whose answer and unprotected-session state are set by the test.
pub struct ScriptedAuthorizer {
    grant: AtomicBool,
    unprotected: AtomicBool,
    listeners: Listeners<ProtectionEvent>,
}

impl ScriptedAuthorizer {
    pub fn new(grant: bool) -> Self {
        Self {
            grant: AtomicBool::new(grant),
            unprotected: AtomicBool::new(false),
            listeners: Listeners::new(),
        }
    }

    pub fn set_grant(&self, grant: bool) {
        self.grant.store(grant, Ordering::SeqCst);
    }

    pub fn begin(&self) {
        self.unprotected.store(true, Ordering::SeqCst);
        self.listeners.emit(&ProtectionEvent::UnprotectedSessionBegan);
    }

    pub fn expire(&self) {
        self.unprotected.store(false, Ordering::SeqCst);
        self.listeners.emit(&ProtectionEvent::UnprotectedSessionExpired);
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    fn has_unprotected_session(&self) -> bool {
        self.unprotected.load(Ordering::SeqCst)
    }

    async fn authorize(&self, _note: &Note) -> Result<bool> {
        Ok(self.grant.load(Ordering::SeqCst))
    }

    fn subscribe(&self, callback: Callback<ProtectionEvent>) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self(AtomicI64::new(now_ms))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub host: Arc<StaticPluginHost>,
    pub auth: Arc<ScriptedAuthorizer>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store: Arc::new(store),
            host: Arc::new(StaticPluginHost::new()),
            auth: Arc::new(ScriptedAuthorizer::new(false)),
            clock: Arc::new(ManualClock::new(0)),
        }
    }

    pub fn services(&self) -> Services {
        Services::new(self.store.clone(), self.host.clone(), self.auth.clone())
            .with_clock(self.clock.clone())
    }

    pub fn editor(&self, id: &str) -> PluginDescriptor {
        let plugin = PluginDescriptor::new(id, id, PluginArea::Editor);
        self.host.register(plugin.clone());
        plugin
    }

    pub fn stack_item(&self, id: &str, name: &str) -> PluginDescriptor {
        let plugin = PluginDescriptor::new(id, name, PluginArea::StackItem);
        self.host.register(plugin.clone());
        plugin
    }
}

pub fn config() -> SessionConfig {
    SessionConfig::default()
}

/// Let spawned tasks and the session actor drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
