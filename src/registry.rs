use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::SessionError;
use crate::services::{NoteStore, PluginHost};
use crate::types::{Note, NoteId, PluginDescriptor, PluginId, ViewHandle};

/// Whether an instance has already been torn down and rebuilt on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadGuard {
    Fresh,
    AlreadyReloaded,
}

struct ViewInstance {
    handle: ViewHandle,
    plugin: PluginDescriptor,
    reload: ReloadGuard,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EditorChange {
    /// The editor slot now holds a different plugin (or none).
    pub changed: bool,
    /// Set when a template note had to be persisted before attaching.
    pub materialized: Option<Note>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackChange {
    pub created: usize,
    pub destroyed: usize,
}

impl StackChange {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.destroyed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded(Option<ViewHandle>),
    /// Unknown handle, or a repeat without `force`.
    Ignored,
}

/// Sole owner of the plugin views attached to one note.
///
/// Instances are removed from their slot before the host is asked to destroy
/// them, so no path can destroy the same view twice. Everyone else only sees
/// [`ViewHandle`]s.
pub struct PluginViewRegistry {
    host: Arc<dyn PluginHost>,
    store: Arc<dyn NoteStore>,
    note_id: NoteId,
    editor: Option<ViewInstance>,
    stack: BTreeMap<PluginId, ViewInstance>,
}

impl PluginViewRegistry {
    pub fn new(host: Arc<dyn PluginHost>, store: Arc<dyn NoteStore>, note_id: impl Into<NoteId>) -> Self {
        Self {
            host,
            store,
            note_id: note_id.into(),
            editor: None,
            stack: BTreeMap::new(),
        }
    }

    /// Put `plugin` in the editor slot. The previous view is destroyed before
    /// the new one is created. Plugin views can't address unsaved notes, so a
    /// template is inserted first.
    pub async fn set_editor_plugin(
        &mut self,
        plugin: Option<PluginDescriptor>,
        note: &Note,
        is_template: bool,
    ) -> Result<EditorChange, SessionError> {
        let mut outcome = EditorChange::default();
        if let (Some(_), true) = (&plugin, is_template) {
            let inserted = self
                .store
                .insert_note(note)
                .await
                .map_err(|e| SessionError::persistence(&note.id, &e))?;
            tracing::info!(note_id = %note.id, "Template note inserted for editor plugin");
            outcome.materialized = Some(inserted);
        }

        let current = self.editor.as_ref().map(|v| v.plugin.id.as_str());
        if current == plugin.as_ref().map(|p| p.id.as_str()) {
            return Ok(outcome);
        }

        if let Some(old) = self.editor.take() {
            self.destroy(old).await;
        }
        if let Some(plugin) = plugin {
            self.editor = self.create(plugin, ReloadGuard::Fresh).await;
        }
        outcome.changed = true;
        Ok(outcome)
    }

    /// Make the stack views match `enabled`: create what's missing, destroy
    /// what's no longer enabled, leave the rest alone.
    pub async fn reconcile_stack_plugins(&mut self, enabled: &[PluginDescriptor]) -> StackChange {
        let wanted: BTreeSet<&str> = enabled.iter().map(|p| p.id.as_str()).collect();
        let mut change = StackChange::default();

        let stale: Vec<PluginId> = self
            .stack
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(instance) = self.stack.remove(&id) {
                self.destroy(instance).await;
                change.destroyed += 1;
            }
        }

        for plugin in enabled {
            if self.stack.contains_key(&plugin.id) {
                continue;
            }
            let id = plugin.id.clone();
            if let Some(instance) = self.create(plugin.clone(), ReloadGuard::Fresh).await {
                self.stack.insert(id, instance);
                change.created += 1;
            }
        }
        change
    }

    /// Destroy and recreate the view behind `handle`. Only the first request
    /// per instance is honoured unless `force` is set.
    pub async fn request_reload(&mut self, handle: ViewHandle, force: bool) -> ReloadOutcome {
        if self.editor.as_ref().is_some_and(|v| v.handle == handle) {
            let Some(instance) = self.editor.take_if_reloadable(force) else {
                return ReloadOutcome::Ignored;
            };
            let plugin = instance.plugin.clone();
            self.destroy(instance).await;
            self.editor = self.create(plugin, ReloadGuard::AlreadyReloaded).await;
            return ReloadOutcome::Reloaded(self.editor_handle());
        }

        let Some(id) = self
            .stack
            .iter()
            .find(|(_, v)| v.handle == handle)
            .map(|(id, _)| id.clone())
        else {
            return ReloadOutcome::Ignored;
        };
        if !force && self.stack.get(&id).is_some_and(|v| v.reload == ReloadGuard::AlreadyReloaded) {
            return ReloadOutcome::Ignored;
        }
        let Some(instance) = self.stack.remove(&id) else {
            return ReloadOutcome::Ignored;
        };
        let plugin = instance.plugin.clone();
        self.destroy(instance).await;
        let recreated = self.create(plugin, ReloadGuard::AlreadyReloaded).await;
        let new_handle = recreated.as_ref().map(|v| v.handle);
        if let Some(instance) = recreated {
            self.stack.insert(id, instance);
        }
        ReloadOutcome::Reloaded(new_handle)
    }

    pub async fn destroy_all(&mut self) {
        if let Some(editor) = self.editor.take() {
            self.destroy(editor).await;
        }
        let stack = std::mem::take(&mut self.stack);
        for (_, instance) in stack {
            self.destroy(instance).await;
        }
    }

    pub fn editor_handle(&self) -> Option<ViewHandle> {
        self.editor.as_ref().map(|v| v.handle)
    }

    /// Stack handles in plugin-name order.
    pub fn stack_handles(&self) -> Vec<ViewHandle> {
        let mut views: Vec<&ViewInstance> = self.stack.values().collect();
        views.sort_by_key(|v| v.plugin.name.to_lowercase());
        views.into_iter().map(|v| v.handle).collect()
    }

    #[cfg(test)]
    fn count_active_editor_views(&self) -> usize {
        usize::from(self.editor.is_some())
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.editor.is_none() && self.stack.is_empty()
    }

    async fn create(&self, plugin: PluginDescriptor, reload: ReloadGuard) -> Option<ViewInstance> {
        match self.host.create_view(&plugin, &self.note_id).await {
            Ok(handle) => {
                tracing::info!(note_id = %self.note_id, plugin = %plugin.name, view = %handle, "Plugin view created");
                Some(ViewInstance { handle, plugin, reload })
            }
            Err(e) => {
                let err = SessionError::plugin_host(&plugin.name, &e);
                tracing::warn!(note_id = %self.note_id, "Leaving plugin slot empty: {err}");
                None
            }
        }
    }

    async fn destroy(&self, instance: ViewInstance) {
        match self.host.destroy_view(instance.handle).await {
            Ok(()) => tracing::info!(
                note_id = %self.note_id,
                plugin = %instance.plugin.name,
                view = %instance.handle,
                "Plugin view destroyed"
            ),
            Err(e) => tracing::warn!(view = %instance.handle, "Plugin host failed to destroy view: {e:#}"),
        }
    }
}

trait TakeReloadable {
    fn take_if_reloadable(&mut self, force: bool) -> Option<ViewInstance>;
}

impl TakeReloadable for Option<ViewInstance> {
    fn take_if_reloadable(&mut self, force: bool) -> Option<ViewInstance> {
        match self {
            Some(instance) if force || instance.reload == ReloadGuard::Fresh => self.take(),
            _ => None,
        }
    }
}
