use std::time::Duration;

use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionCheck {
    /// Inactivity reached the threshold; content must be hidden.
    Hide,
    /// Still inside the window; a re-check is armed for the remaining time.
    Armed(Duration),
}

/// Time-boxed visibility of a protected note's content.
pub struct ProtectionTimer<M> {
    threshold: Duration,
    timer: Timer<M>,
    visibility: Visibility,
}

impl<M: Send + 'static> ProtectionTimer<M> {
    pub fn new(threshold: Duration, timer: Timer<M>) -> Self {
        Self {
            threshold,
            timer,
            visibility: Visibility::Visible,
        }
    }

    /// Hide if the note has been idle for the whole threshold, otherwise
    /// re-check once the remainder has passed.
    pub fn check(&mut self, since_last_edit: Duration) -> ProtectionCheck {
        if since_last_edit >= self.threshold {
            self.hide();
            return ProtectionCheck::Hide;
        }
        let remaining = self.threshold - since_last_edit;
        self.timer.arm(remaining);
        ProtectionCheck::Armed(remaining)
    }

    /// True if the armed re-check is the one that fired.
    pub fn on_timer(&mut self, generation: u64) -> bool {
        self.timer.accept(generation) && self.visibility == Visibility::Visible
    }

    pub fn hide(&mut self) {
        self.timer.cancel();
        self.visibility = Visibility::Hidden;
    }

    pub fn reveal(&mut self) {
        self.timer.cancel();
        self.visibility = Visibility::Visible;
    }

    /// Drop any pending re-check without changing visibility.
    pub fn clear(&mut self) {
        self.timer.cancel();
    }

    pub fn is_hidden(&self) -> bool {
        self.visibility == Visibility::Hidden
    }

    #[cfg(test)]
    fn is_armed(&self) -> bool {
        self.timer.is_armed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::tests::context;

    fn protection() -> (ProtectionTimer<u64>, tokio::sync::mpsc::UnboundedReceiver<u64>) {
        let (ctx, rx, _token) = context();
        (ProtectionTimer::new(Duration::from_secs(30), Timer::new(ctx, |g| g)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn arms_for_the_remaining_window() {
        let (mut protection, mut rx) = protection();
        let check = protection.check(Duration::from_secs(10));
        assert_eq!(check, ProtectionCheck::Armed(Duration::from_secs(20)));
        assert!(!protection.is_hidden());

        tokio::time::sleep(Duration::from_millis(19_999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        let generation = rx.try_recv().expect("re-check fired after 20s");
        assert!(protection.on_timer(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_past_threshold_hides() {
        let (mut protection, _rx) = protection();
        assert_eq!(protection.check(Duration::from_secs(30)), ProtectionCheck::Hide);
        assert!(protection.is_hidden());
        assert!(!protection.is_armed());

        protection.reveal();
        assert!(!protection.is_hidden());
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_keeps_one_outstanding_timer() {
        let (mut protection, mut rx) = protection();
        protection.check(Duration::from_secs(10));
        protection.check(Duration::from_secs(25));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let generation = rx.try_recv().expect("second arming fired at 5s");
        assert!(protection.on_timer(generation));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err(), "first arming was cancelled");
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_is_ignored() {
        let (mut protection, mut rx) = protection();
        protection.check(Duration::from_secs(29));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let generation = rx.try_recv().expect("fired");
        protection.clear();
        assert!(!protection.on_timer(generation));
    }
}
