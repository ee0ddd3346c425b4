use crate::{store::Shared, Error};
use futures::Stream;
use patchbay_controller_core::{Resource, Selector};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq)]
pub enum Event<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> Event<T> {
    pub fn resource(&self) -> &T {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }

    pub fn into_resource(self) -> T {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LogRecord<T> {
    pub(crate) revision: u64,
    pub(crate) event: Event<T>,
}

/// An infinite sequence of transitions, lossless within the store's event
/// window. Dropping the watcher releases it.
#[derive(Debug)]
pub struct Watcher<T> {
    shared: Arc<Shared<T>>,
    selector: Selector,
    last_rev: u64,
    rev_rx: watch::Receiver<u64>,
}

impl<T: Resource> Watcher<T> {
    pub(crate) fn new(shared: Arc<Shared<T>>, selector: Selector, last_rev: u64) -> Self {
        let rev_rx = shared.rev_tx.subscribe();
        Self {
            shared,
            selector,
            last_rev,
            rev_rx,
        }
    }

    /// Revision of the last delivered (or skipped) event.
    pub fn revision(&self) -> u64 {
        self.last_rev
    }

    /// Waits for the next matching transition.
    ///
    /// Fails with [`Error::WindowExpired`] when the watcher fell so far
    /// behind that unobserved events were evicted from the window; the
    /// caller must re-list and restart rather than continue with a gap.
    pub async fn next(&mut self) -> Result<Event<T>, Error> {
        loop {
            {
                let state = self.shared.state.read();
                if state.revision > self.last_rev {
                    match state.log.front() {
                        Some(front) if front.revision <= self.last_rev + 1 => {}
                        front => {
                            return Err(Error::WindowExpired {
                                since: self.last_rev,
                                oldest: front.map(|r| r.revision).unwrap_or(0),
                            });
                        }
                    }
                    for record in state.log.iter() {
                        if record.revision <= self.last_rev {
                            continue;
                        }
                        self.last_rev = record.revision;
                        if self
                            .selector
                            .matches(&record.event.resource().metadata().labels)
                        {
                            return Ok(record.event.clone());
                        }
                    }
                }
            }

            // Caught up; wait for the next write. The sender lives in
            // `shared`, so this cannot fail while the watcher exists.
            let _ = self.rev_rx.changed().await;
        }
    }

    /// Adapts the watcher into a `Stream`. Window expiry is delivered as a
    /// final error item, after which the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event<T>, Error>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut watcher = state?;
            match watcher.next().await {
                Ok(event) => Some((Ok(event), Some(watcher))),
                Err(error) => Some((Err(error), None)),
            }
        })
    }
}
