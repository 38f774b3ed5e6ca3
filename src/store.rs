use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::events::{Callback, Listeners, Subscription};
use crate::services::{unix_ms, NoteStore};
use crate::types::{AppEvent, ChangeSource, Note, NoteChange, NoteMutation, SaveRequest};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notes (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL DEFAULT '',
    body            TEXT NOT NULL DEFAULT '',
    locked          INTEGER NOT NULL DEFAULT 0,
    protected       INTEGER NOT NULL DEFAULT 0,
    trashed         INTEGER NOT NULL DEFAULT 0,
    dirty           INTEGER NOT NULL DEFAULT 0,
    spellcheck      INTEGER NOT NULL DEFAULT 1,
    user_modified   INTEGER NOT NULL DEFAULT 0,
    last_sync_began INTEGER,
    last_sync_end   INTEGER
);";

const NOTE_COLUMNS: &str = "id, title, body, locked, protected, trashed, dirty, spellcheck,
     user_modified, last_sync_began, last_sync_end";

/// SQLite-backed note store. Every write is echoed to note subscribers with
/// the change source a sync engine would report.
pub struct SqliteNoteStore {
    conn: Mutex<Connection>,
    has_account: bool,
    note_listeners: Listeners<NoteChange>,
    event_listeners: Listeners<AppEvent>,
}

impl SqliteNoteStore {
    /// Open (or create) a note database on disk.
    /// WAL must be set before the schema is created; busy_timeout covers a
    /// sync engine writing the same file.
    pub fn open(path: impl AsRef<Path>, has_account: bool) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn, has_account)
    }

    pub fn open_in_memory(has_account: bool) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, has_account)
    }

    fn with_connection(conn: Connection, has_account: bool) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            has_account,
            note_listeners: Listeners::new(),
            event_listeners: Listeners::new(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| anyhow!("note db lock poisoned: {e}"))
    }

    fn fetch(&self, id: &str) -> Result<Option<Note>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"))?;
        Ok(stmt.query_row([id], note_from_row).optional()?)
    }

    fn write(&self, note: &Note) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notes (id, title, body, locked, protected, trashed, dirty, spellcheck,
                                user_modified, last_sync_began, last_sync_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                body = excluded.body,
                locked = excluded.locked,
                protected = excluded.protected,
                trashed = excluded.trashed,
                dirty = excluded.dirty,
                spellcheck = excluded.spellcheck,
                user_modified = excluded.user_modified,
                last_sync_began = excluded.last_sync_began,
                last_sync_end = excluded.last_sync_end",
            params![
                note.id,
                note.title,
                note.body,
                note.locked,
                note.protected,
                note.trashed,
                note.dirty,
                note.spellcheck,
                note.user_modified,
                note.last_sync_began,
                note.last_sync_end,
            ],
        )?;
        Ok(())
    }

    fn notify(&self, note: Note, source: ChangeSource) {
        self.note_listeners.emit(&NoteChange { note, source });
    }

    /// Store a version pulled from the server and announce it as retrieved.
    pub fn apply_retrieved(&self, mut note: Note) -> Result<Note> {
        note.dirty = false;
        self.write(&note)?;
        self.notify(note.clone(), ChangeSource::RetrievedFromStorage);
        Ok(note)
    }

    /// Record a sync round for one note. A completed round clears `dirty`.
    pub fn mark_synced(&self, id: &str, began: i64, ended: Option<i64>) -> Result<Note> {
        let mut note = self.fetch(id)?.ok_or_else(|| anyhow!("note {id} not found"))?;
        note.last_sync_began = Some(began);
        note.last_sync_end = ended;
        if ended.is_some_and(|end| end >= began) {
            note.dirty = false;
        }
        self.write(&note)?;
        self.notify(note.clone(), ChangeSource::LocalEdit);
        Ok(note)
    }

    /// Relay a sync lifecycle signal to event subscribers.
    pub fn emit_event(&self, event: AppEvent) {
        self.event_listeners.emit(&event);
    }

    pub fn all_notes(&self) -> Result<Vec<Note>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTE_COLUMNS} FROM notes WHERE trashed = 0 ORDER BY user_modified DESC"
        ))?;
        let notes = stmt
            .query_map([], note_from_row)?
            .filter_map(|r| {
                r.map_err(|e| tracing::warn!("Skipping malformed row: {e}"))
                    .ok()
            })
            .collect();
        Ok(notes)
    }
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        title: row.get::<_, String>(1).unwrap_or_default(),
        body: row.get::<_, String>(2).unwrap_or_default(),
        locked: row.get(3)?,
        protected: row.get(4)?,
        trashed: row.get(5)?,
        dirty: row.get(6)?,
        spellcheck: row.get(7)?,
        user_modified: row.get(8)?,
        last_sync_began: row.get(9)?,
        last_sync_end: row.get(10)?,
    })
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn get_note(&self, id: &str) -> Result<Option<Note>> {
        self.fetch(id)
    }

    async fn save_note(&self, id: &str, request: &SaveRequest) -> Result<Note> {
        let mut note = self.fetch(id)?.ok_or_else(|| anyhow!("note {id} not found"))?;
        note.title = request.title.clone();
        note.body = request.body.clone();
        match request.mutation {
            Some(NoteMutation::Trash) => note.trashed = true,
            Some(NoteMutation::SetLocked(locked)) => note.locked = locked,
            None => {}
        }
        note.user_modified = unix_ms();
        note.dirty = true;
        self.write(&note)?;
        self.notify(note.clone(), ChangeSource::LocalEdit);
        Ok(note)
    }

    async fn insert_note(&self, note: &Note) -> Result<Note> {
        if let Some(existing) = self.fetch(&note.id)? {
            return Ok(existing);
        }
        let mut inserted = note.clone();
        inserted.dirty = true;
        inserted.user_modified = unix_ms();
        self.write(&inserted)?;
        self.notify(inserted.clone(), ChangeSource::LocalInsert);
        Ok(inserted)
    }

    async fn delete_note(&self, note: &Note) -> Result<()> {
        let removed = self.conn()?.execute("DELETE FROM notes WHERE id = ?1", [&note.id])?;
        if removed == 0 {
            return Err(anyhow!("note {} not found", note.id));
        }
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
