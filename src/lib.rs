//! Editing-session controller for a single open note.
//!
//! A [`SessionController`] binds one note to its plugin views, debounces and
//! serializes saves, derives the sync status label and hides protected
//! content after inactivity. Storage, the plugin host and re-authorization
//! are reached through the traits in [`services`].

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod plugins;
pub mod protection;
pub mod registry;
pub mod save;
pub mod services;
pub mod status;
pub mod store;
pub mod timer;
pub mod types;

pub use config::SessionConfig;
pub use controller::SessionController;
pub use error::SessionError;
pub use events::{Listeners, Subscription};
pub use plugins::StaticPluginHost;
pub use services::{Authorizer, Clock, NoteStore, PluginHost, Services, StaticAuthorizer, SystemClock};
pub use store::SqliteNoteStore;
pub use types::*;

/// Install the global fmt subscriber. Safe to call more than once.
pub fn init_tracing() {
    // Only log WARN and above in release builds to avoid leaking note content
    #[cfg(debug_assertions)]
    let _ = tracing_subscriber::fmt().try_init();
    #[cfg(not(debug_assertions))]
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
