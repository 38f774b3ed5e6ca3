use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where deferred callbacks deliver their message, and the session validity
/// token they check before doing so.
pub struct TimerContext<M> {
    tx: mpsc::UnboundedSender<M>,
    token: CancellationToken,
}

impl<M> TimerContext<M> {
    pub fn new(tx: mpsc::UnboundedSender<M>, token: CancellationToken) -> Self {
        Self { tx, token }
    }
}

impl<M> Clone for TimerContext<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

/// A single re-armable deferred message.
///
/// At most one task is outstanding. Every message carries the generation it
/// was armed with; the owner passes it back through [`Timer::accept`], which
/// only admits the most recent arming, so a message already queued by a
/// superseded or cancelled timer is dropped.
pub struct Timer<M> {
    ctx: TimerContext<M>,
    make: fn(u64) -> M,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> Timer<M> {
    pub fn new(ctx: TimerContext<M>, make: fn(u64) -> M) -> Self {
        Self {
            ctx,
            make,
            generation: 0,
            task: None,
        }
    }

    /// Cancels any pending fire and schedules a new one after `delay`.
    pub fn arm(&mut self, delay: Duration) -> u64 {
        self.abort_task();
        self.generation += 1;
        let generation = self.generation;
        let tx = self.ctx.tx.clone();
        let token = self.ctx.token.clone();
        let make = self.make;
        self.task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        let _ = tx.send(make(generation));
                    }
                }
            }
        }));
        generation
    }

    pub fn cancel(&mut self) {
        self.abort_task();
    }

    /// True if `generation` belongs to the live arming; the timer is then
    /// considered fired.
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.task.is_some() && generation == self.generation {
            self.task = None;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl<M> Timer<M> {
    fn abort_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<M> Drop for Timer<M> {
    fn drop(&mut self) {
        self.abort_task();
    }
}
