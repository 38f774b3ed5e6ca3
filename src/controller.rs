//! The editing session for one open note.
//!
//! A [`SessionController`] is a handle to an actor task that owns all mutable
//! session state. Commands from the view layer, change notifications from the
//! store and plugin host, and every deferred timer are funnelled through one
//! queue and applied in arrival order, so nothing inside a session needs a
//! lock. Slow operations (persistence, permanent deletion, re-authorization)
//! run in their own tasks and report back through the same queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::Subscription;
use crate::protection::{ProtectionCheck, ProtectionTimer};
use crate::registry::{PluginViewRegistry, ReloadOutcome};
use crate::save::SaveScheduler;
use crate::services::Services;
use crate::status::SyncStatusMachine;
use crate::timer::{Timer, TimerContext};
use crate::types::{
    AppEvent, ChangeSource, EditField, Note, NoteChange, NoteId, NoteMutation, PluginArea,
    PluginChangeSource, PluginDescriptor, PluginSetChange, ProtectionEvent, SaveRequest,
    SessionSnapshot, ViewHandle,
};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Edit { field: EditField, value: String, reply: Reply<()> },
    NoteChanged { change: NoteChange, reply: Option<Reply<()>> },
    App(AppEvent),
    Protection(ProtectionEvent),
    PluginsChanged(PluginSetChange),
    RequestDelete { permanently: bool, reply: Reply<()> },
    ToggleLock { reply: Reply<()> },
    DismissOverlay { reply: Reply<()> },
    AuthorizationResolved { granted: bool, reply: Reply<()> },
    ToggleStackPlugin { plugin_id: String, reply: Reply<()> },
    ReloadView { handle: ViewHandle, force: bool, reply: Reply<bool> },
    SaveFinished(Result<Note, String>),
    SaveTimer(u64),
    StatusTimer(u64),
    ProtectionTimer(u64),
    EditorReloadTimer(u64),
}

/// Local copy of one editable field.
///
/// `edited` records that the user typed into it, so an empty value the user
/// chose is not refilled from an incoming change.
#[derive(Debug, Clone, Default)]
struct Field {
    value: String,
    edited: bool,
}

impl Field {
    fn seeded(value: &str) -> Self {
        Self {
            value: value.to_string(),
            edited: false,
        }
    }

    fn accepts_echo(&self) -> bool {
        self.value.is_empty() && !self.edited
    }
}

/// Everything one open note owns. Dropped as a whole when the actor exits.
struct Session {
    note: Note,
    title: Field,
    body: Field,
    is_template: bool,
    locked: bool,
    spellcheck: bool,
    closed: bool,
    /// Local edits count as activity before any save lands.
    last_edit_ms: i64,

    registry: PluginViewRegistry,
    saves: SaveScheduler<Command>,
    status: SyncStatusMachine<Command>,
    protection: ProtectionTimer<Command>,
    editor_reload: Timer<Command>,

    services: Services,
    config: SessionConfig,
    subscriptions: Vec<Subscription>,
    tx: mpsc::UnboundedSender<Command>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    /// Serializes persistence calls, including the final flush at teardown.
    write_lane: Arc<Mutex<()>>,
}

impl Session {
    fn new(
        note: Note,
        is_template: bool,
        services: Services,
        config: SessionConfig,
        tx: mpsc::UnboundedSender<Command>,
        token: CancellationToken,
        snapshot_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let ctx = TimerContext::new(tx.clone(), token);
        let registry = PluginViewRegistry::new(
            services.plugins.clone(),
            services.store.clone(),
            note.id.clone(),
        );
        Self {
            title: Field::seeded(&note.title),
            body: Field::seeded(&note.body),
            is_template,
            locked: note.locked,
            spellcheck: note.spellcheck,
            closed: false,
            last_edit_ms: 0,
            registry,
            saves: SaveScheduler::new(config.save_debounce, Timer::new(ctx.clone(), Command::SaveTimer)),
            status: SyncStatusMachine::new(
                config.min_status_duration,
                services.store.has_account(),
                Timer::new(ctx.clone(), Command::StatusTimer),
            ),
            protection: ProtectionTimer::new(
                config.protection_threshold,
                Timer::new(ctx.clone(), Command::ProtectionTimer),
            ),
            editor_reload: Timer::new(ctx, Command::EditorReloadTimer),
            note,
            services,
            config,
            subscriptions: Vec::new(),
            tx,
            snapshot_tx,
            write_lane: Arc::new(Mutex::new(())),
        }
    }

    fn subscribe(&mut self) {
        let tx = self.tx.clone();
        self.subscriptions.push(self.services.store.subscribe_note(
            &self.note.id,
            Box::new(move |change: &NoteChange| {
                let _ = tx.send(Command::NoteChanged {
                    change: change.clone(),
                    reply: None,
                });
            }),
        ));
        let tx = self.tx.clone();
        self.subscriptions.push(self.services.store.subscribe_events(Box::new(
            move |event: &AppEvent| {
                let _ = tx.send(Command::App(*event));
            },
        )));
        let tx = self.tx.clone();
        self.subscriptions.push(self.services.plugins.subscribe(Box::new(
            move |change: &PluginSetChange| {
                let _ = tx.send(Command::PluginsChanged(change.clone()));
            },
        )));
        let tx = self.tx.clone();
        self.subscriptions.push(self.services.auth.subscribe(Box::new(
            move |event: &ProtectionEvent| {
                let _ = tx.send(Command::Protection(*event));
            },
        )));
    }

    /// Initial load: decide on the protection overlay, then attach views.
    async fn load(&mut self) {
        if self.note.protected && !self.services.auth.has_unprotected_session() {
            tracing::info!(note_id = %self.note.id, "Protected note opened behind overlay");
            self.protection.hide();
            return;
        }
        self.reload_views().await;
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, token: CancellationToken) {
        self.publish();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => {
                        self.handle(command).await;
                        self.publish();
                    }
                    None => break,
                },
            }
        }
        self.teardown().await;
    }

    async fn handle(&mut self, command: Command) {
        if self.closed {
            return;
        }
        match command {
            Command::Edit { field, value, reply } => {
                let result = self.edit(field, value);
                self.respond(reply, result);
            }
            Command::NoteChanged { change, reply } => {
                let result = self.note_changed(change).await;
                match reply {
                    Some(reply) => {
                        self.respond(reply, result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!("Dropped note change: {e}");
                        }
                    }
                }
            }
            Command::App(event) => self.status.on_sync_event(event, self.note.dirty),
            Command::Protection(event) => self.protection_event(event).await,
            Command::PluginsChanged(change) => self.plugins_changed(change).await,
            Command::RequestDelete { permanently, reply } => self.request_delete(permanently, reply),
            Command::ToggleLock { reply } => {
                let result = self.toggle_lock();
                self.respond(reply, result);
            }
            Command::DismissOverlay { reply } => self.dismiss_overlay(reply),
            Command::AuthorizationResolved { granted, reply } => {
                let result = self.authorization_resolved(granted).await;
                self.respond(reply, result);
            }
            Command::ToggleStackPlugin { plugin_id, reply } => {
                let result = self.toggle_stack_plugin(&plugin_id).await;
                self.respond(reply, result);
            }
            Command::ReloadView { handle, force, reply } => {
                let reloaded = if self.protection.is_hidden() {
                    false
                } else {
                    matches!(
                        self.registry.request_reload(handle, force).await,
                        ReloadOutcome::Reloaded(_)
                    )
                };
                self.respond(reply, Ok(reloaded));
            }
            Command::SaveFinished(result) => self.save_finished(result),
            Command::SaveTimer(generation) => {
                let request = self.saves.on_timer(generation);
                self.issue(request);
            }
            Command::StatusTimer(generation) => {
                self.status.on_timer(generation);
            }
            Command::ProtectionTimer(generation) => {
                if self.protection.on_timer(generation) {
                    self.check_protection().await;
                }
            }
            Command::EditorReloadTimer(generation) => {
                if self.editor_reload.accept(generation) {
                    self.reload_editor().await;
                }
            }
        }
    }

    fn edit(&mut self, field: EditField, value: String) -> Result<(), SessionError> {
        if self.locked {
            return Err(SessionError::NoteLocked);
        }
        let request = match field {
            EditField::Title => {
                self.title = Field { value, edited: true };
                SaveRequest::edit(&self.title.value, &self.body.value).without_preview_update()
            }
            EditField::Body => {
                self.body = Field { value, edited: true };
                SaveRequest::edit(&self.title.value, &self.body.value)
            }
        };
        self.last_edit_ms = self.services.clock.now_ms();
        self.status.on_edit();
        let request = self.saves.schedule(request);
        self.issue(request);
        Ok(())
    }

    async fn note_changed(&mut self, change: NoteChange) -> Result<(), SessionError> {
        let NoteChange { note, source } = change;
        if note.id != self.note.id {
            tracing::error!(expected = %self.note.id, received = %note.id, "Change routed to the wrong session");
            return Err(SessionError::WrongNote {
                expected: self.note.id.clone(),
                received: note.id,
            });
        }

        if source.is_retrieved() {
            self.title = Field::seeded(&note.title);
            self.body = Field::seeded(&note.body);
            // Unsent saves must not write the superseded local text back.
            self.saves.rebase(&note.title, &note.body);
        } else {
            if self.title.accepts_echo() {
                self.title = Field::seeded(&note.title);
            }
            if self.body.accepts_echo() {
                self.body = Field::seeded(&note.body);
            }
        }

        if note.locked != self.locked {
            tracing::debug!(note_id = %note.id, locked = note.locked, "Lock state changed");
            self.locked = note.locked;
        }
        self.spellcheck = note.spellcheck;
        if source == ChangeSource::LocalInsert {
            self.is_template = false;
        }

        self.status.on_note_changed(&note, source);

        let unprotected = self.note.protected && !note.protected;
        self.note = note;
        if unprotected {
            self.protection.clear();
            if self.protection.is_hidden() {
                self.reveal().await;
            }
        }
        Ok(())
    }

    fn request_delete(&mut self, permanently: bool, reply: Reply<()>) {
        if self.is_template {
            self.respond(reply, Err(SessionError::TemplateNote));
            return;
        }
        if self.locked {
            self.respond(reply, Err(SessionError::NoteLocked));
            return;
        }
        if permanently {
            let discarded = self.saves.drain().len();
            if discarded > 0 {
                tracing::debug!(note_id = %self.note.id, discarded, "Dropping unsent saves of a deleted note");
            }
            let store = self.services.store.clone();
            let note = self.note.clone();
            tokio::spawn(async move {
                let result = store
                    .delete_note(&note)
                    .await
                    .map_err(|e| SessionError::persistence(&note.id, &e));
                if result.is_ok() {
                    tracing::info!(note_id = %note.id, "Note deleted permanently");
                }
                let _ = reply.send(result);
            });
            return;
        }
        let request = SaveRequest::edit(&self.title.value, &self.body.value)
            .urgent()
            .without_preview_update()
            .with_mutation(NoteMutation::Trash);
        let request = self.saves.schedule(request);
        self.issue(request);
        self.respond(reply, Ok(()));
    }

    fn toggle_lock(&mut self) -> Result<(), SessionError> {
        self.locked = !self.locked;
        let request = SaveRequest::edit(&self.title.value, &self.body.value)
            .urgent()
            .without_preview_update()
            .with_mutation(NoteMutation::SetLocked(self.locked));
        let request = self.saves.schedule(request);
        self.issue(request);
        Ok(())
    }

    fn dismiss_overlay(&mut self, reply: Reply<()>) {
        if !self.protection.is_hidden() {
            self.respond(reply, Ok(()));
            return;
        }
        let auth = self.services.auth.clone();
        let note = self.note.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let granted = match auth.authorize(&note).await {
                Ok(granted) => granted,
                Err(e) => {
                    tracing::warn!(note_id = %note.id, "Re-authorization failed: {e:#}");
                    false
                }
            };
            let _ = tx.send(Command::AuthorizationResolved { granted, reply });
        });
    }

    async fn authorization_resolved(&mut self, granted: bool) -> Result<(), SessionError> {
        if !granted {
            return Err(SessionError::AuthorizationDenied(self.note.id.clone()));
        }
        if self.protection.is_hidden() {
            self.reveal().await;
        }
        Ok(())
    }

    async fn toggle_stack_plugin(&mut self, plugin_id: &str) -> Result<(), SessionError> {
        let plugin = self
            .services
            .plugins
            .list_plugins(PluginArea::StackItem)
            .into_iter()
            .find(|p| p.id == plugin_id)
            .ok_or_else(|| SessionError::PluginHost {
                plugin: plugin_id.to_string(),
                reason: "not installed".to_string(),
            })?;
        self.ensure_inserted().await?;
        let enable = !plugin.is_explicitly_enabled_for(&self.note.id);
        self.services
            .plugins
            .set_enabled_for_note(plugin_id, &self.note.id, enable)
            .await
            .map_err(|e| SessionError::plugin_host(&plugin.name, &e))?;
        self.reload_stack().await;
        Ok(())
    }

    async fn protection_event(&mut self, event: ProtectionEvent) {
        match event {
            ProtectionEvent::UnprotectedSessionBegan => {
                if self.protection.is_hidden() {
                    self.reveal().await;
                }
            }
            ProtectionEvent::UnprotectedSessionExpired => {
                if self.note.protected {
                    self.check_protection().await;
                }
            }
        }
    }

    async fn plugins_changed(&mut self, change: PluginSetChange) {
        if change.source == PluginChangeSource::Internal {
            return;
        }
        self.reload_stack().await;
        self.editor_reload.arm(self.config.editor_reload_debounce);
    }

    async fn check_protection(&mut self) {
        let last_edit = self.note.user_modified.max(self.last_edit_ms);
        let idle_ms = (self.services.clock.now_ms() - last_edit).max(0) as u64;
        match self.protection.check(Duration::from_millis(idle_ms)) {
            ProtectionCheck::Hide => {
                tracing::info!(note_id = %self.note.id, "Hiding protected note after inactivity");
                self.registry.destroy_all().await;
            }
            ProtectionCheck::Armed(remaining) => {
                tracing::debug!(note_id = %self.note.id, ?remaining, "Protection re-check armed");
            }
        }
    }

    async fn reveal(&mut self) {
        tracing::info!(note_id = %self.note.id, "Protected note revealed");
        self.protection.reveal();
        self.reload_views().await;
    }

    async fn reload_views(&mut self) {
        self.reload_editor().await;
        self.reload_stack().await;
    }

    async fn reload_editor(&mut self) {
        let plugin = if self.protection.is_hidden() {
            None
        } else {
            self.services.plugins.editor_for_note(&self.note)
        };
        match self.registry.set_editor_plugin(plugin, &self.note, self.is_template).await {
            Ok(change) => {
                if let Some(inserted) = change.materialized {
                    self.note = inserted;
                    self.is_template = false;
                }
            }
            Err(e) => {
                tracing::warn!(note_id = %self.note.id, "Editor view not attached: {e}");
                self.status.on_persistence_failure();
            }
        }
    }

    async fn reload_stack(&mut self) {
        let enabled: Vec<PluginDescriptor> = if self.protection.is_hidden() {
            Vec::new()
        } else {
            let mut plugins: Vec<PluginDescriptor> = self
                .services
                .plugins
                .list_plugins(PluginArea::StackItem)
                .into_iter()
                .filter(|p| p.active && p.is_explicitly_enabled_for(&self.note.id))
                .collect();
            plugins.sort_by_key(|p| p.name.to_lowercase());
            plugins
        };
        let change = self.registry.reconcile_stack_plugins(&enabled).await;
        if !change.is_noop() {
            tracing::debug!(note_id = %self.note.id, created = change.created, destroyed = change.destroyed, "Stack views reconciled");
        }
    }

    async fn ensure_inserted(&mut self) -> Result<(), SessionError> {
        if !self.is_template {
            return Ok(());
        }
        let inserted = self
            .services
            .store
            .insert_note(&self.note)
            .await
            .map_err(|e| SessionError::persistence(&self.note.id, &e))?;
        self.note = inserted;
        self.is_template = false;
        Ok(())
    }

    /// Start the persistence call for `request` in its own task.
    fn issue(&mut self, request: Option<SaveRequest>) {
        let Some(request) = request else {
            return;
        };
        let task = self.save_task(request);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = task.await;
            let _ = tx.send(Command::SaveFinished(result));
        });
    }

    fn save_task(
        &self,
        request: SaveRequest,
    ) -> impl std::future::Future<Output = Result<Note, String>> + Send + 'static {
        let store = self.services.store.clone();
        let lane = self.write_lane.clone();
        let template = self.is_template.then(|| self.note.clone());
        let note_id = self.note.id.clone();
        async move {
            let _lane = lane.lock().await;
            if let Some(template) = template {
                store.insert_note(&template).await.map_err(|e| format!("{e:#}"))?;
            }
            tracing::debug!(note_id = %note_id, trashed = (request.mutation == Some(NoteMutation::Trash)), "Saving note");
            store.save_note(&note_id, &request).await.map_err(|e| format!("{e:#}"))
        }
    }

    fn save_finished(&mut self, result: Result<Note, String>) {
        match result {
            Ok(note) => {
                tracing::debug!(note_id = %note.id, "Note saved");
                self.is_template = false;
                self.note = note;
            }
            Err(reason) => {
                let err = SessionError::Persistence {
                    note_id: self.note.id.clone(),
                    reason,
                };
                tracing::warn!("{err}");
                self.status.on_persistence_failure();
            }
        }
        let next = self.saves.on_complete();
        self.issue(next);
    }

    async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for subscription in &mut self.subscriptions {
            subscription.dispose();
        }
        tracing::debug!(note_id = %self.note.id, count = self.subscriptions.len(), "Subscriptions disposed");
        self.subscriptions.clear();
        self.protection.clear();
        self.status.cancel();
        self.editor_reload.cancel();

        // Unsent edits still go out, queued behind any call already in flight.
        for request in self.saves.drain() {
            if let Err(reason) = self.save_task(request).await {
                tracing::warn!(note_id = %self.note.id, "Final save failed: {reason}");
            }
        }

        self.registry.destroy_all().await;
        self.publish();
        tracing::info!(note_id = %self.note.id, "Session closed");
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            note_id: self.note.id.clone(),
            title: self.title.value.clone(),
            body: self.body.value.clone(),
            status: self.status.display(),
            sync_slow: self.status.is_slow(),
            locked: self.locked,
            is_template: self.is_template,
            spellcheck: self.spellcheck,
            editor_view: self.registry.editor_handle(),
            stack_views: self.registry.stack_handles(),
            protection_hidden: self.protection.is_hidden(),
            closed: self.closed,
        }
    }

    fn respond<T>(&self, reply: Reply<T>, result: Result<T, SessionError>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn publish(&self) {
        self.snapshot_tx.send_if_modified(|current| {
            let next = self.snapshot();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Handle to an open note session. Every command waits until the session has
/// applied it, so [`SessionController::snapshot`] reflects it on return.
pub struct SessionController {
    note_id: NoteId,
    tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Open a persisted note.
    pub async fn open(note: Note, services: Services, config: SessionConfig) -> Self {
        Self::start(note, false, services, config).await
    }

    /// Open a note that has not been stored yet. It is inserted on first save
    /// or when a plugin view needs to address it.
    pub async fn open_template(note: Note, services: Services, config: SessionConfig) -> Self {
        Self::start(note, true, services, config).await
    }

    async fn start(note: Note, is_template: bool, services: Services, config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let note_id = note.id.clone();
        tracing::info!(note_id = %note_id, is_template, "Opening note session");

        let placeholder = SessionSnapshot {
            note_id: note_id.clone(),
            title: note.title.clone(),
            body: note.body.clone(),
            status: None,
            sync_slow: false,
            locked: note.locked,
            is_template,
            spellcheck: note.spellcheck,
            editor_view: None,
            stack_views: Vec::new(),
            protection_hidden: false,
            closed: false,
        };
        let (snapshot_tx, snapshot) = watch::channel(placeholder);

        let mut session = Session::new(note, is_template, services, config, tx.clone(), token.clone(), snapshot_tx);
        session.subscribe();
        session.load().await;
        session.publish();
        let task = tokio::spawn(session.run(rx, token.clone()));

        Self {
            note_id,
            tx,
            token,
            snapshot,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn note_id(&self) -> &str {
        &self.note_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that is notified on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub async fn edit(&self, field: EditField, value: impl Into<String>) -> Result<(), SessionError> {
        let value = value.into();
        self.request(|reply| Command::Edit { field, value, reply }).await
    }

    /// Apply an external mutation of the bound note.
    pub async fn note_changed(&self, note: Note, source: ChangeSource) -> Result<(), SessionError> {
        self.request(|reply| Command::NoteChanged {
            change: NoteChange { note, source },
            reply: Some(reply),
        })
        .await
    }

    /// Relay a sync lifecycle event to this session.
    pub fn sync_event(&self, event: AppEvent) -> Result<(), SessionError> {
        self.tx.send(Command::App(event)).map_err(|_| SessionError::Closed)
    }

    /// Trash the note, or delete it for good. Refused for locked or unsaved notes.
    pub async fn request_delete(&self, permanently: bool) -> Result<(), SessionError> {
        self.request(|reply| Command::RequestDelete { permanently, reply }).await
    }

    pub async fn toggle_lock(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::ToggleLock { reply }).await
    }

    /// Ask for re-authorization and show the content if granted.
    pub async fn dismiss_protection_overlay(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::DismissOverlay { reply }).await
    }

    pub async fn toggle_stack_plugin(&self, plugin_id: &str) -> Result<(), SessionError> {
        let plugin_id = plugin_id.to_string();
        self.request(|reply| Command::ToggleStackPlugin { plugin_id, reply }).await
    }

    /// A plugin view asked to be rebuilt. Returns whether it was.
    pub async fn request_view_reload(&self, handle: ViewHandle, force: bool) -> Result<bool, SessionError> {
        self.request(|reply| Command::ReloadView { handle, force, reply }).await
    }

    /// Tear the session down and wait for it. Calling again is a no-op.
    pub async fn close(&self) {
        self.token.cancel();
        // Held across the join so a concurrent close also waits for teardown.
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::warn!(note_id = %self.note_id, "Session task ended abnormally: {e}");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        if self.token.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
