//! Single-shot cancellable timeout delivering an event into a channel.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Re-arming invalidates the previous deadline: its event still arrives
/// if it already fired, but [`Timeout::fire`] rejects its stale generation.
pub struct Timeout<E: Send + 'static> {
    label: &'static str,
    events: mpsc::UnboundedSender<E>,
    make: fn(u64) -> E,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> Timeout<E> {
    pub fn new(label: &'static str, events: mpsc::UnboundedSender<E>, make: fn(u64) -> E) -> Self {
        Self {
            label,
            events,
            make,
            generation: 0,
            task: None,
        }
    }

    /// Schedule the event after `after`, replacing any earlier deadline.
    pub fn arm(&mut self, after: Duration) -> u64 {
        self.disarm();
        let generation = self.generation;
        let events = self.events.clone();
        let event = (self.make)(generation);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        }));
        debug!(timer = self.label, generation, ?after, "armed");
        generation
    }

    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation += 1;
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Accept a fired event. True only for the live generation; the timer is then spent.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.task.is_some() && generation == self.generation {
            self.task = None;
            true
        } else {
            debug!(
                timer = self.label,
                generation,
                current = self.generation,
                "stale timeout ignored"
            );
            false
        }
    }
}

impl<E: Send + 'static> Drop for Timeout<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Fired(u64);

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timeout::new("test", tx, Fired);
        let generation = timer.arm(Duration::from_secs(6));

        tokio::time::sleep(Duration::from_millis(5_999)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;

        let Fired(got) = rx.recv().await.unwrap();
        assert_eq!(got, generation);
        assert!(timer.fire(got));
        assert!(!timer.fire(got));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_invalidates_previous_deadline() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timeout::new("test", tx, Fired);
        let first = timer.arm(Duration::from_secs(1));
        let second = timer.arm(Duration::from_secs(2));
        assert_ne!(first, second);
        assert!(!timer.fire(first));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let Fired(got) = rx.recv().await.unwrap();
        assert_eq!(got, second);
        assert!(rx.try_recv().is_err());
        assert!(timer.fire(got));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timeout::new("test", tx, Fired);
        let generation = timer.arm(Duration::from_secs(1));
        timer.disarm();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.fire(generation));
    }
}
