//! Observable state cells
//!
//! A [`StateCell`] has exactly one owner that writes it and any number of
//! readers that either poll the current value or subscribe to changes.
//! Waiting for a value is an ordinary future, so it is cancelled by dropping it.

use std::fmt::Debug;

use tokio::sync::watch;

/// Single-writer, multi-reader state holder
pub struct StateCell<T> {
    name: &'static str,
    tx: watch::Sender<T>,
}

impl<T> StateCell<T>
where
    T: Copy + PartialEq + Debug + Send + Sync + 'static,
{
    pub fn new(name: &'static str, initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { name, tx }
    }

    /// Current value
    pub fn get(&self) -> T {
        *self.tx.borrow()
    }

    /// Unconditionally move to `next`
    pub fn set(&self, next: T) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            tracing::debug!("{} state: {:?} -> {:?}", self.name, prev, next);
        }
    }

    /// Atomically move to `next` if the current value satisfies `allowed`.
    /// Returns the value observed before the attempt and whether it moved.
    pub fn transition(&self, allowed: impl Fn(T) -> bool, next: T) -> (T, bool) {
        let mut observed = self.get();
        let moved = self.tx.send_if_modified(|current| {
            observed = *current;
            if allowed(*current) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!("{} state: {:?} -> {:?}", self.name, observed, next);
        }
        (observed, moved)
    }

    /// Subscribe to future changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Wait until the value satisfies `pred`; resolves immediately if it already does.
    pub async fn wait_for(&self, pred: impl FnMut(&T) -> bool) -> T {
        let mut rx = self.tx.subscribe();
        let seen = match rx.wait_for(pred).await {
            Ok(value) => *value,
            // The sender lives in `self`, so the channel cannot close while we borrow it
            Err(_) => self.get(),
        };
        seen
    }
}
