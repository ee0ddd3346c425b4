use crate::{
    watch::{Event, LogRecord, Watcher},
    Error,
};
use ahash::AHashMap as HashMap;
use chrono::Utc;
use parking_lot::RwLock;
use patchbay_controller_core::{Resource, Selector};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::watch;

/// Number of events retained for watch resumption.
const DEFAULT_WINDOW: usize = 1024;

#[derive(Debug)]
pub struct Store<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Shared<T> {
    namespace: String,
    pub(crate) state: RwLock<State<T>>,
    pub(crate) rev_tx: watch::Sender<u64>,
}

#[derive(Debug)]
pub(crate) struct State<T> {
    pub(crate) revision: u64,
    uid_counter: u64,
    entries: HashMap<String, Entry<T>>,
    pub(crate) log: VecDeque<LogRecord<T>>,
    window: usize,
}

#[derive(Debug)]
struct Entry<T> {
    obj: T,
    /// Revision of the last spec write.
    spec_rev: u64,
    /// Revision of the last status write.
    status_rev: u64,
}

impl<T: Resource> Store<T> {
    pub fn new(namespace: &str) -> Self {
        Self::with_window(namespace, DEFAULT_WINDOW)
    }

    pub fn with_window(namespace: &str, window: usize) -> Self {
        let (rev_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.to_string(),
                state: RwLock::new(State {
                    revision: 0,
                    uid_counter: 0,
                    entries: HashMap::new(),
                    log: VecDeque::new(),
                    window: window.max(1),
                }),
                rev_tx,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    pub fn revision(&self) -> u64 {
        self.shared.state.read().revision
    }

    pub fn get(&self, name: &str) -> Result<T, Error> {
        self.shared
            .state
            .read()
            .entries
            .get(name)
            .map(|e| e.obj.clone())
            .ok_or_else(|| Error::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    pub fn list(&self, selector: &Selector) -> Vec<T> {
        let state = self.shared.state.read();
        let mut objs = state
            .entries
            .values()
            .filter(|e| selector.matches(&e.obj.metadata().labels))
            .map(|e| e.obj.clone())
            .collect::<Vec<_>>();
        objs.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        objs
    }

    pub fn create(&self, mut obj: T) -> Result<T, Error> {
        if obj.metadata().name.is_empty() {
            return Err(Error::Invalid {
                kind: T::KIND,
                reason: "name must not be empty".to_string(),
            });
        }
        if obj.metadata().namespace.is_empty() {
            obj.metadata_mut().namespace = self.shared.namespace.clone();
        } else if obj.metadata().namespace != self.shared.namespace {
            return Err(Error::Invalid {
                kind: T::KIND,
                reason: format!(
                    "namespace {:?} is outside this store's namespace {:?}",
                    obj.metadata().namespace,
                    self.shared.namespace
                ),
            });
        }

        let mut state = self.shared.state.write();
        if state.entries.contains_key(&obj.metadata().name) {
            return Err(Error::AlreadyExists {
                kind: T::KIND,
                name: obj.metadata().name.clone(),
            });
        }

        let revision = state.revision + 1;
        state.revision = revision;
        state.uid_counter += 1;
        {
            let meta = obj.metadata_mut();
            meta.uid = format!("{:016x}", state.uid_counter);
            meta.resource_version = revision;
            meta.generation = 1;
            meta.creation_timestamp = Some(Utc::now());
        }
        state.entries.insert(
            obj.metadata().name.clone(),
            Entry {
                obj: obj.clone(),
                spec_rev: revision,
                status_rev: revision,
            },
        );
        state.push(LogRecord {
            revision,
            event: Event::Added(obj.clone()),
        });
        drop(state);

        self.shared.rev_tx.send_replace(revision);
        Ok(obj)
    }

    /// Writes the spec half. Fails with `Conflict` when the spec has been
    /// rewritten since the caller read `obj`; concurrent status writes do
    /// not conflict.
    pub fn update(&self, obj: T) -> Result<T, Error> {
        self.write(obj, false)
    }

    /// Writes the status half, symmetric with [`Store::update`].
    pub fn update_status(&self, obj: T) -> Result<T, Error> {
        self.write(obj, true)
    }

    fn write(&self, obj: T, status: bool) -> Result<T, Error> {
        let name = obj.metadata().name.clone();
        let observed = obj.metadata().resource_version;

        let mut state = self.shared.state.write();
        let entry = state.entries.get(&name).ok_or_else(|| Error::NotFound {
            kind: T::KIND,
            name: name.clone(),
        })?;

        let half_rev = if status {
            entry.status_rev
        } else {
            entry.spec_rev
        };
        if half_rev > observed {
            return Err(Error::Conflict {
                kind: T::KIND,
                name,
                observed,
                current: half_rev,
            });
        }

        let mut next = entry.obj.clone();
        if status {
            next.copy_status_from(&obj);
        } else {
            next.copy_spec_from(&obj);
        }
        if status {
            if next == entry.obj {
                return Ok(next);
            }
        } else if next.spec_eq(&entry.obj) {
            return Ok(next);
        }

        let revision = state.revision + 1;
        state.revision = revision;
        next.metadata_mut().resource_version = revision;
        if !status {
            next.metadata_mut().generation += 1;
        }

        let entry = state.entries.get_mut(&name).expect("entry just observed");
        entry.obj = next.clone();
        if status {
            entry.status_rev = revision;
        } else {
            entry.spec_rev = revision;
        }
        state.push(LogRecord {
            revision,
            event: Event::Modified(next.clone()),
        });
        drop(state);

        self.shared.rev_tx.send_replace(revision);
        Ok(next)
    }

    pub fn delete(&self, name: &str, precondition: Option<u64>) -> Result<T, Error> {
        let mut state = self.shared.state.write();
        let entry = state.entries.get(name).ok_or_else(|| Error::NotFound {
            kind: T::KIND,
            name: name.to_string(),
        })?;

        if let Some(observed) = precondition {
            let current = entry.obj.metadata().resource_version;
            if current != observed {
                return Err(Error::Conflict {
                    kind: T::KIND,
                    name: name.to_string(),
                    observed,
                    current,
                });
            }
        }

        let revision = state.revision + 1;
        state.revision = revision;
        let mut obj = state.entries.remove(name).expect("entry just observed").obj;
        obj.metadata_mut().resource_version = revision;
        state.push(LogRecord {
            revision,
            event: Event::Deleted(obj.clone()),
        });
        drop(state);

        self.shared.rev_tx.send_replace(revision);
        Ok(obj)
    }

    /// Opens a watch. `since` resumes delivery after a previously-observed
    /// revision; `None` starts at the current head, delivering only future
    /// events.
    pub fn watch(&self, selector: Selector, since: Option<u64>) -> Result<Watcher<T>, Error> {
        let state = self.shared.state.read();
        let last_rev = match since {
            None => state.revision,
            Some(v) => {
                let resumable = v >= state.revision
                    || state.log.front().is_some_and(|r| r.revision <= v + 1);
                if !resumable {
                    return Err(Error::WindowExpired {
                        since: v,
                        oldest: state.log.front().map(|r| r.revision).unwrap_or(0),
                    });
                }
                v
            }
        };
        Ok(Watcher::new(self.shared.clone(), selector, last_rev))
    }

    /// Atomically lists the current contents and opens a watch positioned
    /// just after them, so that no transition is missed in between.
    pub fn list_and_watch(&self, selector: Selector) -> (Vec<T>, Watcher<T>) {
        let state = self.shared.state.read();
        let mut objs = state
            .entries
            .values()
            .filter(|e| selector.matches(&e.obj.metadata().labels))
            .map(|e| e.obj.clone())
            .collect::<Vec<_>>();
        objs.sort_by(|a, b| a.metadata().name.cmp(&b.metadata().name));
        let watcher = Watcher::new(self.shared.clone(), selector, state.revision);
        (objs, watcher)
    }
}

impl<T: Resource> State<T> {
    fn push(&mut self, record: LogRecord<T>) {
        self.log.push_back(record);
        while self.log.len() > self.window {
            self.log.pop_front();
        }
    }
}
