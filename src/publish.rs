use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::core::Dynamic;
use crate::engine::{Continuation, Flow};
use crate::error::UsageError;
use crate::key::{Key, VersionTag};
use crate::utils::lock;

type Tag = (Key, VersionTag);

/// State of one `(key, version)` pair as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PublicationStatus {
    /// Nobody published or fetched it.
    Unknown,
    /// Fetched but not published yet.
    Pending { fetchers: usize },
    /// Published, with fetches still to come.
    Open { remaining: usize },
    /// Published and fetched exactly as often as declared.
    Exhausted,
}

/// A publication that never got all of its declared fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Leak {
    pub key: Key,
    pub version: VersionTag,
    pub remaining: usize,
}

/// Fetches waiting for a publication that has not happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingFetch {
    pub key: String,
    pub version: String,
    pub fetchers: usize,
}

struct Record {
    /// `Some` once the published flow is ready.
    value: Option<Option<Dynamic>>,
    remaining: usize,
    /// Fetch placeholders to satisfy once the value is known.
    waiting: Vec<Arc<Flow>>,
}

/// One published version of a key.
pub(crate) struct Publication {
    key: Key,
    version: VersionTag,
    n_readers: usize,
    state: Mutex<Record>,
}

impl Publication {
    /// Stores the published value and hands back the placeholders to satisfy
    /// with it.
    pub(crate) fn resolve(&self, value: Option<Dynamic>) -> Vec<Arc<Flow>> {
        let mut record = lock(&self.state);
        assert!(
            record.value.is_none(),
            "publication {}@{} resolved twice",
            self.key,
            self.version
        );
        record.value = Some(value);

        tracing::debug!(key = %self.key, version = %self.version, "publication resolved");
        std::mem::take(&mut record.waiting)
    }

    /// Registers one fetch. Returns the value right away if it is known.
    fn attach(&self, placeholder: Arc<Flow>) -> Option<(Arc<Flow>, Option<Dynamic>)> {
        let mut record = lock(&self.state);
        record.remaining -= 1;

        match &record.value {
            Some(value) => Some((placeholder, value.clone())),
            None => {
                record.waiting.push(placeholder);
                None
            }
        }
    }

    fn remaining(&self) -> usize {
        lock(&self.state).remaining
    }

    /// Fetch placeholders still waiting for the published value.
    pub(crate) fn placeholders(&self) -> Vec<Arc<Flow>> {
        lock(&self.state).waiting.clone()
    }
}

#[derive(Default)]
struct Tables {
    live: HashMap<Tag, Arc<Publication>>,
    pending: HashMap<Tag, Vec<Arc<Flow>>>,
    /// Publications whose every declared fetch happened, with their reader
    /// count.
    retired: HashMap<Tag, usize>,
}

/// Matches publications with fetches by `(key, version)`.
///
/// One coordinator is shared by every rank that may exchange data. The
/// coordinator does not move bytes, it hands the published value to the
/// fetching placeholder flows. A transport between processes would carry
/// [`Key::to_bytes`] and the version tag as the correlation id.
#[derive(Default)]
pub struct Coordinator {
    tables: Mutex<Tables>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `flow` as `(key, version)` for exactly `n_readers` fetches.
    pub(crate) fn publish(
        &self,
        key: &Key,
        version: &VersionTag,
        flow: Arc<Flow>,
        n_readers: usize,
    ) -> Result<(), UsageError> {
        let tag = (key.clone(), version.clone());

        let publication = {
            let mut tables = lock(&self.tables);

            if tables.live.contains_key(&tag) || tables.retired.contains_key(&tag) {
                return Err(UsageError::DuplicatePublication {
                    key: key.clone(),
                    version: version.clone(),
                });
            }

            let fetchers = tables.pending.get(&tag).map_or(0, Vec::len);
            if fetchers > n_readers {
                return Err(UsageError::OverSubscribed {
                    key: key.clone(),
                    version: version.clone(),
                    n_readers,
                });
            }

            let waiting = tables.pending.remove(&tag).unwrap_or_default();
            let publication = Arc::new(Publication {
                key: key.clone(),
                version: version.clone(),
                n_readers,
                state: Mutex::new(Record {
                    value: None,
                    remaining: n_readers - waiting.len(),
                    waiting,
                }),
            });

            if n_readers == fetchers {
                tables.retired.insert(tag, n_readers);
            } else {
                tables.live.insert(tag, publication.clone());
            }

            publication
        };

        flow.add_waiter(Continuation::Publish(publication));
        Ok(())
    }

    /// Registers `placeholder` as one fetch of `(key, version)`.
    pub(crate) fn fetch(
        &self,
        key: &Key,
        version: &VersionTag,
        placeholder: Arc<Flow>,
    ) -> Result<(), UsageError> {
        let tag = (key.clone(), version.clone());

        let resolved = {
            let mut tables = lock(&self.tables);

            if let Some(&n_readers) = tables.retired.get(&tag) {
                return Err(UsageError::OverSubscribed {
                    key: key.clone(),
                    version: version.clone(),
                    n_readers,
                });
            }

            match tables.live.get(&tag).cloned() {
                Some(publication) => {
                    let resolved = publication.attach(placeholder);
                    if publication.remaining() == 0 {
                        tables.live.remove(&tag);
                        tables.retired.insert(tag, publication.n_readers);
                    }
                    resolved
                }
                None => {
                    tables.pending.entry(tag).or_default().push(placeholder);
                    None
                }
            }
        };

        if let Some((placeholder, value)) = resolved {
            placeholder.advance(value);
        }

        Ok(())
    }

    pub fn status(&self, key: &Key, version: &VersionTag) -> PublicationStatus {
        let tag = (key.clone(), version.clone());
        let tables = lock(&self.tables);

        if tables.retired.contains_key(&tag) {
            PublicationStatus::Exhausted
        } else if let Some(publication) = tables.live.get(&tag) {
            PublicationStatus::Open {
                remaining: publication.remaining(),
            }
        } else if let Some(fetchers) = tables.pending.get(&tag) {
            PublicationStatus::Pending {
                fetchers: fetchers.len(),
            }
        } else {
            PublicationStatus::Unknown
        }
    }

    /// Publications still waiting for fetches.
    pub fn leaks(&self) -> Vec<Leak> {
        let tables = lock(&self.tables);
        let mut leaks: Vec<Leak> = tables
            .live
            .iter()
            .map(|((key, version), publication)| Leak {
                key: key.clone(),
                version: version.clone(),
                remaining: publication.remaining(),
            })
            .collect();

        leaks.sort_by(|a, b| (&a.key, &a.version).cmp(&(&b.key, &b.version)));
        leaks
    }

    /// Fetches still waiting for a publication.
    pub fn unmatched_fetches(&self) -> Vec<PendingFetch> {
        let tables = lock(&self.tables);
        let mut pending: Vec<_> = tables.pending.iter().collect();
        pending.sort_by(|a, b| a.0.cmp(b.0));

        pending
            .into_iter()
            .map(|((key, version), fetchers)| PendingFetch {
                key: key.to_string(),
                version: version.to_string(),
                fetchers: fetchers.len(),
            })
            .collect()
    }

    /// Logs a warning for every leaked publication and unmatched fetch.
    pub(crate) fn report(&self) -> Vec<Leak> {
        let leaks = self.leaks();
        for leak in &leaks {
            tracing::warn!(
                key = %leak.key,
                version = %leak.version,
                remaining = leak.remaining,
                "publication was fetched fewer times than declared"
            );
        }

        for fetch in self.unmatched_fetches() {
            tracing::warn!(
                key = %fetch.key,
                version = %fetch.version,
                fetchers = fetch.fetchers,
                "fetch never matched a publication"
            );
        }

        leaks
    }
}
