use std::collections::VecDeque;
use std::time::Duration;

use crate::timer::Timer;
use crate::types::SaveRequest;

/// Coalesces edit intents into persistence calls.
///
/// The scheduler never performs I/O itself: every method returns the request
/// the caller must issue now, if any, and the caller reports completion via
/// [`SaveScheduler::on_complete`]. At most one request is in flight; anything
/// scheduled meanwhile is merged into as few follow-ups as the mutations allow.
pub struct SaveScheduler<M> {
    delay: Duration,
    timer: Timer<M>,
    /// Waiting for the debounce window to close.
    pending: Option<SaveRequest>,
    in_flight: Option<SaveRequest>,
    /// Ready to go, in order, as soon as the in-flight call resolves.
    queued: VecDeque<SaveRequest>,
}

impl<M: Send + 'static> SaveScheduler<M> {
    pub fn new(delay: Duration, timer: Timer<M>) -> Self {
        Self {
            delay,
            timer,
            pending: None,
            in_flight: None,
            queued: VecDeque::new(),
        }
    }

    pub fn schedule(&mut self, request: SaveRequest) -> Option<SaveRequest> {
        let (released, request) = match self.pending.take() {
            Some(pending) if pending.can_merge(&request) => (None, pending.merge(request)),
            Some(pending) => {
                self.timer.cancel();
                (self.dispatch(pending), request)
            }
            None => (None, request),
        };
        if request.bypass_debounce {
            self.timer.cancel();
            let issued = self.dispatch(request);
            released.or(issued)
        } else {
            // Every edit restarts the window.
            self.pending = Some(request);
            self.timer.arm(self.delay);
            released
        }
    }

    /// The debounce timer fired.
    pub fn on_timer(&mut self, generation: u64) -> Option<SaveRequest> {
        if !self.timer.accept(generation) {
            return None;
        }
        let request = self.pending.take()?;
        self.dispatch(request)
    }

    /// The in-flight call resolved, successfully or not.
    pub fn on_complete(&mut self) -> Option<SaveRequest> {
        let mut finished = self.in_flight.take();
        while let Some(next) = self.queued.pop_front() {
            if let Some(done) = &finished {
                if next.mutation.is_none() && done.same_payload(&next) {
                    tracing::debug!("Dropping follow-up save identical to the one just written");
                    finished = Some(next);
                    continue;
                }
            }
            self.in_flight = Some(next.clone());
            return Some(next);
        }
        None
    }

    /// Point every unsent request at new content, keeping their mutations.
    pub fn rebase(&mut self, title: &str, body: &str) {
        for request in self.pending.iter_mut().chain(self.queued.iter_mut()) {
            request.title = title.to_string();
            request.body = body.to_string();
        }
    }

    /// Everything not yet handed out, in issue order. Used at teardown, when
    /// no completion will ever be reported, and to discard unsent work.
    pub fn drain(&mut self) -> Vec<SaveRequest> {
        self.timer.cancel();
        let mut drained: Vec<SaveRequest> = self.queued.drain(..).collect();
        if let Some(pending) = self.pending.take() {
            match drained.pop() {
                Some(last) if last.can_merge(&pending) => drained.push(last.merge(pending)),
                Some(last) => drained.extend([last, pending]),
                None => drained.push(pending),
            }
        }
        drained
    }

    #[cfg(test)]
    fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    #[cfg(test)]
    fn has_pending(&self) -> bool {
        self.pending.is_some() || !self.queued.is_empty()
    }

    fn dispatch(&mut self, request: SaveRequest) -> Option<SaveRequest> {
        if self.in_flight.is_none() {
            self.in_flight = Some(request.clone());
            return Some(request);
        }
        match self.queued.pop_back() {
            Some(last) if last.can_merge(&request) => self.queued.push_back(last.merge(request)),
            Some(last) => self.queued.extend([last, request]),
            None => self.queued.push_back(request),
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::tests::context;
    use crate::types::NoteMutation;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn scheduler() -> (SaveScheduler<u64>, UnboundedReceiver<u64>) {
        let (ctx, rx, _token) = context();
        let timer = Timer::new(ctx, |g| g);
        (SaveScheduler::new(Duration::from_millis(100), timer), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn edits_within_window_collapse_to_last() {
        let (mut saves, mut rx) = scheduler();
        assert!(saves.schedule(SaveRequest::edit("A", "b")).is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(saves.schedule(SaveRequest::edit("AB", "b")).is_none());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "window restarts on each edit");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let generation = rx.try_recv().expect("timer fired");
        let issued = saves.on_timer(generation).expect("one save");
        assert_eq!(issued.title, "AB");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn urgent_request_goes_out_immediately() {
        let (mut saves, mut rx) = scheduler();
        saves.schedule(SaveRequest::edit("A", "draft"));
        let issued = saves
            .schedule(SaveRequest::edit("A", "final").urgent().with_mutation(NoteMutation::Trash))
            .expect("bypass debounce");
        assert_eq!(issued.body, "final");
        assert_eq!(issued.mutation, Some(NoteMutation::Trash));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "pending timer was cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn requests_during_flight_merge_into_one_follow_up() {
        let (mut saves, _rx) = scheduler();
        let first = saves.schedule(SaveRequest::edit("t", "1").urgent());
        assert!(first.is_some());
        assert!(saves.schedule(SaveRequest::edit("t", "2").urgent()).is_none());
        assert!(saves.schedule(SaveRequest::edit("t", "3").urgent()).is_none());

        let next = saves.on_complete().expect("queued request issued");
        assert_eq!(next.body, "3");
        assert!(saves.is_in_flight());
        assert!(saves.on_complete().is_none());
        assert!(!saves.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_mutations_queue_separately() {
        let (mut saves, _rx) = scheduler();
        saves.schedule(SaveRequest::edit("t", "1").urgent());
        let trash = SaveRequest::edit("t", "1").urgent().with_mutation(NoteMutation::Trash);
        let lock = SaveRequest::edit("t", "1").urgent().with_mutation(NoteMutation::SetLocked(true));
        assert!(saves.schedule(trash).is_none());
        assert!(saves.schedule(lock).is_none());

        let second = saves.on_complete().expect("trash follows");
        assert_eq!(second.mutation, Some(NoteMutation::Trash));
        let third = saves.on_complete().expect("lock follows");
        assert_eq!(third.mutation, Some(NoteMutation::SetLocked(true)));
        assert!(saves.on_complete().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn identical_follow_up_collapses() {
        let (mut saves, _rx) = scheduler();
        saves.schedule(SaveRequest::edit("t", "same").urgent());
        saves.schedule(SaveRequest::edit("t", "same").urgent());
        assert!(saves.on_complete().is_none());
        assert!(!saves.has_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rebase_rewrites_unsent_payloads() {
        let (mut saves, _rx) = scheduler();
        saves.schedule(SaveRequest::edit("t", "1").urgent());
        saves.schedule(SaveRequest::edit("t", "2").urgent().with_mutation(NoteMutation::Trash));
        saves.schedule(SaveRequest::edit("t", "3"));
        saves.rebase("remote", "remote body");

        let drained = saves.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, "remote body");
        assert_eq!(drained[0].mutation, Some(NoteMutation::Trash));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_everything_unsent() {
        let (mut saves, mut rx) = scheduler();
        saves.schedule(SaveRequest::edit("t", "1").urgent());
        saves.schedule(SaveRequest::edit("t", "2").urgent());
        saves.schedule(SaveRequest::edit("t", "3"));
        let drained = saves.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body, "3");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        assert!(saves.drain().is_empty());
    }
}
