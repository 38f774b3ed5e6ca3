use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::events::{Callback, Listeners, Subscription};
use crate::services::PluginHost;
use crate::types::{
    Note, NoteId, PluginArea, PluginChangeSource, PluginDescriptor, PluginId, PluginSetChange,
    ViewHandle,
};

#[derive(Default)]
struct HostState {
    plugins: BTreeMap<PluginId, PluginDescriptor>,
    /// Editor plugin chosen per note.
    editors: HashMap<NoteId, PluginId>,
    live: BTreeMap<ViewHandle, (PluginId, NoteId)>,
    next_handle: u64,
    created: usize,
    destroyed: usize,
    failing: HashSet<PluginId>,
}

/// Counters of view lifecycles seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStats {
    pub created: usize,
    pub destroyed: usize,
    pub live: usize,
}

/// In-process plugin host holding a fixed catalogue of plugins.
///
/// Views are bookkeeping entries addressed by sequential handles; destroying
/// an unknown handle is an error so double destroys surface.
#[derive(Default)]
pub struct StaticPluginHost {
    state: Mutex<HostState>,
    listeners: Listeners<PluginSetChange>,
}

impl StaticPluginHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn announce(&self, source: PluginChangeSource) {
        self.listeners.emit(&PluginSetChange { source });
    }

    /// Add or replace a plugin; announced as an external change.
    pub fn register(&self, plugin: PluginDescriptor) {
        self.state().plugins.insert(plugin.id.clone(), plugin);
        self.announce(PluginChangeSource::External);
    }

    pub fn set_active(&self, plugin_id: &str, active: bool) {
        if let Some(plugin) = self.state().plugins.get_mut(plugin_id) {
            plugin.active = active;
        }
        self.announce(PluginChangeSource::External);
    }

    /// Choose the editor plugin for a note (`None` restores the plain editor).
    pub fn assign_editor(&self, note_id: &str, plugin_id: Option<&str>) {
        {
            let mut state = self.state();
            match plugin_id {
                Some(id) => state.editors.insert(note_id.to_string(), id.to_string()),
                None => state.editors.remove(note_id),
            };
        }
        self.announce(PluginChangeSource::External);
    }

    /// Make every subsequent `create_view` for this plugin fail.
    pub fn fail_views_for(&self, plugin_id: &str) {
        self.state().failing.insert(plugin_id.to_string());
    }

    pub fn stats(&self) -> ViewStats {
        let state = self.state();
        ViewStats {
            created: state.created,
            destroyed: state.destroyed,
            live: state.live.len(),
        }
    }

    /// Live views as (handle, plugin, note).
    pub fn live_views(&self) -> Vec<(ViewHandle, PluginId, NoteId)> {
        self.state()
            .live
            .iter()
            .map(|(handle, (plugin, note))| (*handle, plugin.clone(), note.clone()))
            .collect()
    }

    pub fn live_views_in_area(&self, area: PluginArea) -> usize {
        let state = self.state();
        state
            .live
            .values()
            .filter(|(plugin, _)| state.plugins.get(plugin).is_some_and(|p| p.area == area))
            .count()
    }
}

#[async_trait]
impl PluginHost for StaticPluginHost {
    async fn create_view(&self, plugin: &PluginDescriptor, note_id: &str) -> Result<ViewHandle> {
        let mut state = self.state();
        if state.failing.contains(&plugin.id) {
            bail!("plugin {} failed to start", plugin.id);
        }
        if !state.plugins.contains_key(&plugin.id) {
            bail!("plugin {} is not installed", plugin.id);
        }
        state.next_handle += 1;
        let handle = ViewHandle(state.next_handle);
        state.live.insert(handle, (plugin.id.clone(), note_id.to_string()));
        state.created += 1;
        Ok(handle)
    }

    async fn destroy_view(&self, handle: ViewHandle) -> Result<()> {
        let mut state = self.state();
        state
            .live
            .remove(&handle)
            .ok_or_else(|| anyhow!("unknown view {handle}"))?;
        state.destroyed += 1;
        Ok(())
    }

    fn list_plugins(&self, area: PluginArea) -> Vec<PluginDescriptor> {
        self.state()
            .plugins
            .values()
            .filter(|p| p.area == area)
            .cloned()
            .collect()
    }

    fn editor_for_note(&self, note: &Note) -> Option<PluginDescriptor> {
        let state = self.state();
        let id = state.editors.get(&note.id)?;
        state
            .plugins
            .get(id)
            .filter(|p| p.active && p.area == PluginArea::Editor)
            .cloned()
    }

    async fn set_enabled_for_note(&self, plugin_id: &str, note_id: &str, enabled: bool) -> Result<()> {
        {
            let mut state = self.state();
            let plugin = state
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| anyhow!("plugin {plugin_id} is not installed"))?;
            if enabled {
                plugin.enabled_notes.insert(note_id.to_string());
            } else {
                plugin.enabled_notes.remove(note_id);
            }
        }
        self.announce(PluginChangeSource::Internal);
        Ok(())
    }

    fn subscribe(&self, callback: Callback<PluginSetChange>) -> Subscription {
        self.listeners.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, id, PluginArea::Editor)
    }

    #[tokio::test]
    async fn views_are_created_and_destroyed_once() {
        let host = StaticPluginHost::new();
        let plugin = editor("markdown");
        host.register(plugin.clone());

        let handle = host.create_view(&plugin, "n1").await.unwrap();
        assert_eq!(host.stats(), ViewStats { created: 1, destroyed: 0, live: 1 });

        host.destroy_view(handle).await.unwrap();
        assert!(host.destroy_view(handle).await.is_err());
        assert_eq!(host.stats(), ViewStats { created: 1, destroyed: 1, live: 0 });
    }

    #[tokio::test]
    async fn failing_and_unknown_plugins_do_not_create_views() {
        let host = StaticPluginHost::new();
        let plugin = editor("markdown");
        assert!(host.create_view(&plugin, "n1").await.is_err());
        host.register(plugin.clone());
        host.fail_views_for("markdown");
        assert!(host.create_view(&plugin, "n1").await.is_err());
        assert_eq!(host.stats().created, 0);
    }

    #[tokio::test]
    async fn editor_assignment_requires_active_editor() {
        let host = StaticPluginHost::new();
        host.register(editor("markdown"));
        let note = Note::new("n1", "", "");
        assert!(host.editor_for_note(&note).is_none());

        host.assign_editor("n1", Some("markdown"));
        assert_eq!(host.editor_for_note(&note).map(|p| p.id), Some("markdown".to_string()));

        host.set_active("markdown", false);
        assert!(host.editor_for_note(&note).is_none());
    }

    #[tokio::test]
    async fn enablement_changes_are_internal() {
        let host = StaticPluginHost::new();
        host.register(PluginDescriptor::new("spell", "Spell", PluginArea::StackItem));
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = host.subscribe(Box::new(move |change: &PluginSetChange| {
            sink.lock().unwrap().push(change.source)
        }));

        host.set_enabled_for_note("spell", "n1", true).await.unwrap();
        let listed = host.list_plugins(PluginArea::StackItem);
        assert!(listed[0].is_explicitly_enabled_for("n1"));
        assert_eq!(*seen.lock().unwrap(), vec![PluginChangeSource::Internal]);
    }
}
