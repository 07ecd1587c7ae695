//! Process-wide relay of asynchronous interpreter output.
//!
//! The host publishes every line its interpreter prints (warnings, print
//! statements, output of deferred commands) through [`OutputRelay::publish`].
//! Each session on an echo-enabled port holds an [`OutputSubscription`]
//! and flushes it between requests.
//!
//! Publishing never blocks: every subscriber has its own unbounded queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct RelayInner {
    next_id: u64,
    subscribers: HashMap<u64, UnboundedSender<String>>,
}

/// Cloneable handle to the output fan-out.
#[derive(Clone, Default)]
pub struct OutputRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl std::fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRelay")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

fn lock(inner: &Mutex<RelayInner>) -> MutexGuard<'_, RelayInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl OutputRelay {
    /// Create an empty relay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `message` for every live subscriber.
    ///
    /// Subscribers whose receiving end is gone are pruned.
    pub fn publish(&self, message: impl Into<String>) {
        let message = message.into();
        let mut inner = lock(&self.inner);
        inner
            .subscribers
            .retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        OutputSubscription {
            id,
            rx,
            relay: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

/// One session's queue of relayed output. Unsubscribes on drop.
pub struct OutputSubscription {
    id: u64,
    rx: UnboundedReceiver<String>,
    relay: Weak<Mutex<RelayInner>>,
}

impl std::fmt::Debug for OutputSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl OutputSubscription {
    /// Take every line queued so far without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(line) => lines.push(line),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        lines
    }
}

impl Drop for OutputSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.relay.upgrade() {
            lock(&inner).subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_fans_out_to_every_subscriber() {
        let relay = OutputRelay::new();
        let mut a = relay.subscribe();
        let mut b = relay.subscribe();

        relay.publish("// Warning: x");
        relay.publish("done");

        assert_eq!(a.drain(), vec!["// Warning: x", "done"]);
        assert_eq!(b.drain(), vec!["// Warning: x", "done"]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let relay = OutputRelay::new();
        let sub = relay.subscribe();
        assert_eq!(relay.subscriber_count(), 1);
        drop(sub);
        assert_eq!(relay.subscriber_count(), 0);
        relay.publish("nobody listening");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let relay = OutputRelay::new();
        relay.publish("lost");
        let mut late = relay.subscribe();
        assert!(late.drain().is_empty());
    }

    #[test]
    fn test_subscription_outliving_relay() {
        let relay = OutputRelay::new();
        let mut sub = relay.subscribe();
        relay.publish("last words");
        drop(relay);
        assert_eq!(sub.drain(), vec!["last words"]);
    }
}
