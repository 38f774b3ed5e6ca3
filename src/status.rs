use std::time::Duration;

use tokio::time::Instant;

use crate::timer::Timer;
use crate::types::{AppEvent, ChangeSource, Note, StatusDisplay};

/// Derives the save/sync label shown next to the note.
///
/// Renders are spaced at least `min_duration` apart so labels don't flicker;
/// a status arriving sooner waits out the remainder and is replaced if
/// another one arrives first. Errors render immediately.
pub struct SyncStatusMachine<M> {
    min_duration: Duration,
    has_account: bool,
    timer: Timer<M>,
    displayed: Option<StatusDisplay>,
    pending: Option<StatusDisplay>,
    last_render: Option<Instant>,
    save_error: bool,
    slow_sync: bool,
}

impl<M: Send + 'static> SyncStatusMachine<M> {
    pub fn new(min_duration: Duration, has_account: bool, timer: Timer<M>) -> Self {
        Self {
            min_duration,
            has_account,
            timer,
            displayed: None,
            pending: None,
            last_render: None,
            save_error: false,
            slow_sync: false,
        }
    }

    pub fn on_edit(&mut self) {
        self.set_status(StatusDisplay::saving(), false);
    }

    /// Re-derive the status from a note's dirty flag and sync timestamps.
    pub fn on_note_changed(&mut self, note: &Note, source: ChangeSource) {
        // Materializing a template is not a save the user asked for.
        if source == ChangeSource::LocalInsert && note.dirty {
            return;
        }
        if note.last_sync_began.is_none() && !note.dirty {
            return;
        }
        match (note.last_sync_began, note.last_sync_end) {
            (Some(began), Some(end)) => {
                if note.dirty || began > end {
                    self.show_saving();
                } else if self.has_status() {
                    self.show_saved();
                }
            }
            (None, Some(_)) => {
                if note.dirty {
                    self.show_saving();
                }
            }
            (_, None) => self.show_saving(),
        }
    }

    pub fn on_sync_event(&mut self, event: AppEvent, note_dirty: bool) {
        match event {
            AppEvent::SyncStarted => {
                if note_dirty {
                    self.show_saving();
                }
            }
            AppEvent::SyncCompleted => {
                self.slow_sync = false;
                // Still dirty means another sync is due; keep what we show.
                if !note_dirty && self.save_error {
                    self.show_saved();
                }
            }
            AppEvent::SyncFailed => {
                // A clean note means the failed round belonged to other items.
                if note_dirty {
                    self.show_error(StatusDisplay::sync_unreachable());
                }
            }
            AppEvent::HighLatency => self.slow_sync = true,
            AppEvent::LocalWriteError => self.show_error(StatusDisplay::offline_saving_issue()),
        }
    }

    pub fn on_persistence_failure(&mut self) {
        self.show_error(StatusDisplay::offline_saving_issue());
    }

    /// The deferred render fired. Returns true if the label changed.
    pub fn on_timer(&mut self, generation: u64) -> bool {
        if !self.timer.accept(generation) {
            return false;
        }
        match self.pending.take() {
            Some(status) => {
                self.render(status);
                true
            }
            None => false,
        }
    }

    pub fn display(&self) -> Option<StatusDisplay> {
        self.displayed.clone().map(|mut status| {
            status.is_slow = self.slow_sync;
            status
        })
    }

    pub fn is_slow(&self) -> bool {
        self.slow_sync
    }

    #[cfg(test)]
    fn is_error(&self) -> bool {
        self.save_error
    }

    pub fn cancel(&mut self) {
        self.timer.cancel();
        self.pending = None;
    }

    fn has_status(&self) -> bool {
        self.displayed.is_some() || self.pending.is_some()
    }

    fn show_saving(&mut self) {
        self.set_status(StatusDisplay::saving(), false);
    }

    fn show_saved(&mut self) {
        self.save_error = false;
        self.slow_sync = false;
        self.set_status(StatusDisplay::saved(self.has_account), false);
    }

    fn show_error(&mut self, status: StatusDisplay) {
        self.save_error = true;
        self.slow_sync = false;
        self.set_status(status, true);
    }

    fn set_status(&mut self, status: StatusDisplay, urgent: bool) {
        if self.displayed.as_ref() == Some(&status) {
            // Already on screen; whatever was queued behind it is obsolete.
            self.cancel();
            return;
        }
        if urgent {
            self.cancel();
            self.render(status);
            return;
        }
        let wait = self
            .last_render
            .map(|at| self.min_duration.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO);
        if wait.is_zero() {
            self.cancel();
            self.render(status);
        } else {
            self.pending = Some(status);
            self.timer.arm(wait);
        }
    }

    fn render(&mut self, status: StatusDisplay) {
        tracing::debug!(message = %status.message, is_error = status.is_error, "Status rendered");
        self.displayed = Some(status);
        self.last_render = Some(Instant::now());
    }
}
