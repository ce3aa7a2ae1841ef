use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::status::Status;

/// Version extracted from a stored value. Strictly increasing per key on
///  every successful update.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConfigVersion(pub u64);

impl Debug for ConfigVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Interprets stored bytes. Returning `None` marks the value as invalid.
pub type ExtractVersionFn = Box<dyn Fn(&[u8]) -> Option<ConfigVersion> + Send + Sync>;

/// Invoked exactly once per read operation.
pub type ValueCallback = Box<dyn FnOnce(Status, Option<Bytes>) + Send>;

/// Invoked exactly once per write operation. On `Ok` it carries the version
///  of the newly written value; on `VersionMismatch` the version that caused
///  the mismatch plus the existing value.
pub type WriteCallback = Box<dyn FnOnce(Status, Option<ConfigVersion>, Option<Bytes>) + Send>;

/// Maps the current value (or `None` for an absent key) to the value to
///  write. Only `Ok`, `VersionMismatch` and `Shutdown` may be returned; a
///  non-`Ok` status aborts the read-modify-write and is propagated to the
///  write callback.
pub type MutationCallback = Box<dyn FnMut(Option<&Bytes>) -> (Status, Option<Bytes>) + Send>;

/// Key-value store with strict conditional updates, consumed by the control
///  plane. Callback statuses follow the contract in the method docs; every
///  callback fires exactly once, either with its natural outcome or with
///  `Shutdown`.
///
/// Implementations may invoke callbacks on the caller's thread before the
///  method returns (the in-memory store does) or defer them; the `_sync`
///  wrappers block either way.
pub trait VersionedConfigStore: Send + Sync {
    /// Reads the value for `key`. Statuses: `Ok`, `NotFound`, `Access`,
    ///  `Again`, `InvalidParam`, `InvalidConfig`, `UpToDate`, `Shutdown`.
    ///  With `base_version` set, the value is only delivered if the stored
    ///  version is newer; otherwise the callback observes `UpToDate` with no
    ///  value. Reads need not be linearizable with writes.
    fn get_config(&self, key: &str, cb: ValueCallback, base_version: Option<ConfigVersion>);

    /// Linearizable read: reflects every update that completed before this
    ///  call. More expensive and more failure-prone than `get_config`; for
    ///  callers that cannot tolerate stale values.
    fn get_latest_config(&self, key: &str, cb: ValueCallback);

    /// Writes `value` under `key`. `base_version = None` overwrites
    ///  unconditionally (also used for initial creation); `Some(v)` is a
    ///  strict compare-and-swap against the stored version. Statuses: `Ok`,
    ///  `NotFound` (conditional only), `VersionMismatch`, `Access`, `Again`,
    ///  `BadMessage`, `InvalidParam`, `InvalidConfig`, `Shutdown`.
    ///
    /// On `Ok` the new value's extracted version must be strictly greater
    ///  than the previously stored one; the store verifies this and rejects
    ///  violations with `InvalidParam`.
    fn update_config(
        &self,
        key: &str,
        value: Bytes,
        base_version: Option<ConfigVersion>,
        cb: WriteCallback,
    );

    /// Read-modify-write: reads the current value, applies `mcb`, and
    ///  commits with a conditional update against the version that was read,
    ///  retrying from the top on `VersionMismatch` until either the commit
    ///  succeeds or `mcb` returns non-`Ok`. The write callback observes the
    ///  terminal status.
    fn read_modify_write(&self, key: &str, mcb: MutationCallback, cb: WriteCallback);

    /// After this returns, no new operations are accepted and every
    ///  outstanding callback has fired. May block; call it from a dedicated
    ///  shutdown thread. Calling any method afterwards is undefined.
    fn shutdown(&self);

    fn get_config_sync(
        &self,
        key: &str,
        base_version: Option<ConfigVersion>,
    ) -> (Status, Option<Bytes>) {
        let (tx, rx) = std::sync::mpsc::channel();
        self.get_config(
            key,
            Box::new(move |status, value| {
                let _ = tx.send((status, value));
            }),
            base_version,
        );
        rx.recv().expect("store dropped a read callback")
    }

    fn update_config_sync(
        &self,
        key: &str,
        value: Bytes,
        base_version: Option<ConfigVersion>,
    ) -> (Status, Option<ConfigVersion>, Option<Bytes>) {
        let (tx, rx) = std::sync::mpsc::channel();
        self.update_config(
            key,
            value,
            base_version,
            Box::new(move |status, version, existing| {
                let _ = tx.send((status, version, existing));
            }),
        );
        rx.recv().expect("store dropped a write callback")
    }
}

enum Expectation {
    Absent,
    Version(ConfigVersion),
}

struct StoreState {
    entries: FxHashMap<String, Bytes>,
    shut_down: bool,
}

/// In-memory implementation. All callbacks run synchronously on the caller's
///  thread; `shutdown` flips a flag after which every operation completes
///  with `Shutdown`.
pub struct InMemoryVersionedConfigStore {
    extract_version: ExtractVersionFn,
    state: Mutex<StoreState>,
}

impl InMemoryVersionedConfigStore {
    pub fn new(extract_version: ExtractVersionFn) -> InMemoryVersionedConfigStore {
        InMemoryVersionedConfigStore {
            extract_version,
            state: Mutex::new(StoreState {
                entries: FxHashMap::default(),
                shut_down: false,
            }),
        }
    }

    fn do_get(&self, key: &str, base_version: Option<ConfigVersion>) -> (Status, Option<Bytes>) {
        let state = self.state.lock().expect("store lock poisoned");
        if state.shut_down {
            return (Status::Shutdown, None);
        }
        let Some(value) = state.entries.get(key) else {
            return (Status::NotFound, None);
        };
        let Some(stored_version) = (self.extract_version)(value) else {
            return (Status::InvalidConfig, None);
        };
        if let Some(base) = base_version {
            if base >= stored_version {
                return (Status::UpToDate, None);
            }
        }
        (Status::Ok, Some(value.clone()))
    }

    /// Single CAS step against an exact expectation about the current entry.
    fn do_update(
        &self,
        key: &str,
        value: Bytes,
        expectation: Option<Expectation>,
    ) -> (Status, Option<ConfigVersion>, Option<Bytes>) {
        let Some(new_version) = (self.extract_version)(&value) else {
            return (Status::InvalidParam, None, None);
        };

        let mut state = self.state.lock().expect("store lock poisoned");
        if state.shut_down {
            return (Status::Shutdown, None, None);
        }

        let current = state.entries.get(key).cloned();
        let current_version = match &current {
            Some(bytes) => match (self.extract_version)(bytes) {
                Some(v) => Some(v),
                None => return (Status::InvalidConfig, None, None),
            },
            None => None,
        };

        match expectation {
            None => {}
            Some(Expectation::Absent) => {
                if let Some(v) = current_version {
                    return (Status::VersionMismatch, Some(v), current);
                }
            }
            Some(Expectation::Version(base)) => match current_version {
                None => return (Status::NotFound, None, None),
                Some(v) if v != base => return (Status::VersionMismatch, Some(v), current),
                Some(_) => {}
            },
        }

        if let Some(v) = current_version {
            if new_version <= v {
                debug!(
                    key,
                    ?new_version,
                    current = ?v,
                    "rejecting update that does not advance the version"
                );
                return (Status::InvalidParam, None, None);
            }
        }

        state.entries.insert(key.to_string(), value);
        (Status::Ok, Some(new_version), None)
    }
}

impl VersionedConfigStore for InMemoryVersionedConfigStore {
    fn get_config(&self, key: &str, cb: ValueCallback, base_version: Option<ConfigVersion>) {
        let (status, value) = self.do_get(key, base_version);
        cb(status, value);
    }

    fn get_latest_config(&self, key: &str, cb: ValueCallback) {
        // the in-memory store is trivially linearizable
        let (status, value) = self.do_get(key, None);
        cb(status, value);
    }

    fn update_config(
        &self,
        key: &str,
        value: Bytes,
        base_version: Option<ConfigVersion>,
        cb: WriteCallback,
    ) {
        let (status, version, existing) =
            self.do_update(key, value, base_version.map(Expectation::Version));
        cb(status, version, existing);
    }

    fn read_modify_write(&self, key: &str, mut mcb: MutationCallback, cb: WriteCallback) {
        loop {
            let (read_status, current) = self.do_get(key, None);
            let current = match read_status {
                Status::Ok => current,
                Status::NotFound => None,
                other => {
                    cb(other, None, None);
                    return;
                }
            };

            let (mutation_status, new_value) = mcb(current.as_ref());
            debug_assert!(matches!(
                mutation_status,
                Status::Ok | Status::VersionMismatch | Status::Shutdown
            ));
            if mutation_status != Status::Ok {
                cb(mutation_status, None, None);
                return;
            }
            let Some(new_value) = new_value else {
                cb(Status::InvalidParam, None, None);
                return;
            };

            let expectation = match &current {
                Some(bytes) => match (self.extract_version)(bytes) {
                    Some(v) => Expectation::Version(v),
                    None => {
                        cb(Status::InvalidConfig, None, None);
                        return;
                    }
                },
                None => Expectation::Absent,
            };

            let (status, version, existing) = self.do_update(key, new_value, Some(expectation));
            if status == Status::VersionMismatch {
                // someone else committed between our read and write
                continue;
            }
            cb(status, version, existing);
            return;
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.shut_down = true;
    }
}
