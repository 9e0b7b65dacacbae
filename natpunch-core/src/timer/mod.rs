//! One-shot and periodic timeouts delivered into an actor mailbox.
//!
//! Every scheduled timeout is identified by a [`TimeoutId`]. Cancelling an
//! id aborts the pending task. A timeout that already fired may still sit in
//! the mailbox, so receivers must check the id against their own table and
//! drop the ones they no longer know.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::AbortHandle;

/// Identifies an outstanding request or timer. Zero means "none".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TimeoutId(u64);

impl TimeoutId {
    pub const NONE: TimeoutId = TimeoutId(0);

    pub fn random() -> Self {
        loop {
            let v: u64 = rand::random();
            if v != 0 {
                return TimeoutId(v);
            }
        }
    }
    #[inline]
    pub const fn from_raw(v: u64) -> Self {
        TimeoutId(v)
    }
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TimeoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub struct Timer<E> {
    sender: Sender<E>,
    tasks: Arc<DashMap<TimeoutId, AbortHandle>>,
}

impl<E> Clone for Timer<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<E: Send + 'static> Timer<E> {
    pub fn new(sender: Sender<E>) -> Self {
        Self {
            sender,
            tasks: Default::default(),
        }
    }

    pub fn schedule(&self, delay: Duration, event: E) -> TimeoutId {
        let id = TimeoutId::random();
        self.schedule_with_id(id, delay, event);
        id
    }

    /// Schedules `event` under a caller-chosen id, replacing any timer
    /// already registered under it.
    pub fn schedule_with_id(&self, id: TimeoutId, delay: Duration, event: E) {
        let sender = self.sender.clone();
        let tasks = self.tasks.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            _ = sender.send(event).await;
            tasks.remove(&id);
        });
        self.track(id, handle);
    }

    /// Fires `make_event` after `delay` and then every `period` until cancelled.
    pub fn schedule_periodic<F>(&self, delay: Duration, period: Duration, make_event: F) -> TimeoutId
    where
        F: Fn(TimeoutId) -> E + Send + 'static,
    {
        let id = TimeoutId::random();
        let sender = self.sender.clone();
        let tasks = self.tasks.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + delay;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if sender.send(make_event(id)).await.is_err() {
                    break;
                }
            }
            tasks.remove(&id);
        });
        self.track(id, handle);
        id
    }

    fn track(&self, id: TimeoutId, handle: tokio::task::JoinHandle<()>) {
        if let Some(old) = self.tasks.insert(id, handle.abort_handle()) {
            old.abort();
        }
        if handle.is_finished() {
            self.tasks.remove(&id);
        }
    }

    /// Returns false if the id was unknown or had already fired.
    pub fn cancel(&self, id: TimeoutId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn is_scheduled(&self, id: TimeoutId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::channel;

    #[test]
    fn random_id_is_never_none() {
        for _ in 0..1000 {
            assert!(!TimeoutId::random().is_none());
        }
        assert!(TimeoutId::NONE.is_none());
    }

    #[tokio::test]
    async fn one_shot_fires_once() {
        let (tx, mut rx) = channel(8);
        let timer = Timer::new(tx);
        let id = timer.schedule(Duration::from_millis(10), 7u32);
        assert!(timer.is_scheduled(id));
        assert_eq!(rx.recv().await, Some(7));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!timer.is_scheduled(id));
        assert!(!timer.cancel(id));
    }

    #[tokio::test]
    async fn cancelled_timeout_never_arrives() {
        let (tx, mut rx) = channel(8);
        let timer = Timer::new(tx);
        let cancelled = timer.schedule(Duration::from_millis(30), 1u32);
        timer.schedule(Duration::from_millis(60), 2u32);
        assert!(timer.cancel(cancelled));
        assert_eq!(rx.recv().await, Some(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn periodic_until_cancelled() {
        let (tx, mut rx) = channel(8);
        let timer = Timer::new(tx);
        let id = timer.schedule_periodic(
            Duration::from_millis(5),
            Duration::from_millis(10),
            |id| id,
        );
        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some(id));
        }
        assert!(timer.cancel(id));
        tokio::time::sleep(Duration::from_millis(30)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_clears_table() {
        let (tx, _rx) = channel::<u8>(8);
        let timer = Timer::new(tx);
        timer.schedule(Duration::from_secs(5), 1);
        timer.schedule(Duration::from_secs(5), 2);
        assert_eq!(timer.len(), 2);
        timer.cancel_all();
        assert!(timer.is_empty());
    }
}
