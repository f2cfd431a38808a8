//! Device state store: the three-level `project -> class -> command`
//! dictionary fed by decoded event commands, plus the blocking
//! wait-for-change primitive the orchestrator's bring-up sequence and
//! application code both rely on (spec.md §4.D).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};

use crate::codec::Value;

/// One command's stored content, tagged by the schema's list-kind
/// (spec.md §9: "prefer a tagged variant ... over three parallel
/// methods"). The public API still exposes `put`/`put_list`/`put_map`
/// as distinct methods because spec.md's contract names them
/// individually; this enum is what they write into.
#[derive(Debug, Clone)]
pub enum Slot {
    Single(IndexMap<String, Value>),
    List(Vec<IndexMap<String, Value>>),
    Map(IndexMap<Value, IndexMap<String, Value>>),
}

/// A single registered waiter: a condvar plus a flag guarding against
/// the lost-wakeup race between registration and waiting.
struct WaitHandle {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl WaitHandle {
    fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.signalled.lock() = true;
        self.condvar.notify_all();
    }
}

pub type Dict = HashMap<String, HashMap<String, HashMap<String, Slot>>>;

struct Inner {
    dict: Dict,
    waiters: HashMap<String, Vec<Arc<WaitHandle>>>,
}

/// The store + waiter registry, guarded by a single mutex (spec.md §4.D:
/// "the state store and its waiter registry are always mutated under the
/// same lock").
pub struct Store {
    inner: Mutex<Inner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                dict: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Overwrites the `NONE`-kind slot for `project.class.command`.
    pub fn put(&self, project: &str, class: &str, command: &str, args: IndexMap<String, Value>) {
        let mut inner = self.inner.lock();
        class_dict(&mut inner.dict, project, class).insert(command.to_owned(), Slot::Single(args));
        signal(&mut inner.waiters, project, class, command);
    }

    /// Appends to the `LIST`-kind slot for `project.class.command`.
    pub fn put_list(&self, project: &str, class: &str, command: &str, args: IndexMap<String, Value>) {
        let mut inner = self.inner.lock();
        let dict = class_dict(&mut inner.dict, project, class);
        match dict.entry(command.to_owned()).or_insert_with(|| Slot::List(Vec::new())) {
            Slot::List(list) => list.push(args),
            other => *other = Slot::List(vec![args]),
        }
        signal(&mut inner.waiters, project, class, command);
    }

    /// Inserts/overwrites by `key` in the `MAP`-kind slot for
    /// `project.class.command`.
    pub fn put_map(
        &self,
        project: &str,
        class: &str,
        command: &str,
        args: IndexMap<String, Value>,
        key: Value,
    ) {
        let mut inner = self.inner.lock();
        let dict = class_dict(&mut inner.dict, project, class);
        match dict.entry(command.to_owned()).or_insert_with(|| Slot::Map(IndexMap::new())) {
            Slot::Map(map) => {
                map.insert(key, args);
            }
            other => {
                let mut map = IndexMap::new();
                map.insert(key, args);
                *other = Slot::Map(map);
            }
        }
        signal(&mut inner.waiters, project, class, command);
    }

    /// Returns a deep copy of the slot for `"project.class.command"`, or
    /// `None` if it was never received.
    pub fn get(&self, name: &str) -> Option<Slot> {
        let (project, class, command) = split_name(name)?;
        let inner = self.inner.lock();
        inner
            .dict
            .get(project)?
            .get(class)?
            .get(command)
            .cloned()
    }

    /// Deep copy of the entire store.
    pub fn snapshot(&self) -> Dict {
        self.inner.lock().dict.clone()
    }

    /// Blocks until a `put*` targeting `name` occurs, or `timeout`
    /// elapses. Returns whether a signal arrived. Registration happens
    /// under the lock and is only undone after the wait returns, so a
    /// signal that lands between registering and blocking is never
    /// lost (spec.md §4.D).
    pub fn wait_for(&self, name: &str, timeout: Option<Duration>) -> bool {
        let handle = Arc::new(WaitHandle::new());
        {
            let mut inner = self.inner.lock();
            inner
                .waiters
                .entry(name.to_owned())
                .or_default()
                .push(handle.clone());
        }

        let result = {
            let mut signalled = handle.signalled.lock();
            match timeout {
                Some(timeout) => {
                    let deadline = Instant::now() + timeout;
                    loop {
                        if *signalled {
                            break true;
                        }
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break false;
                        }
                        let wait_result = handle.condvar.wait_for(&mut signalled, remaining);
                        if *signalled {
                            break true;
                        }
                        if wait_result.timed_out() {
                            break false;
                        }
                    }
                }
                None => {
                    while !*signalled {
                        handle.condvar.wait(&mut signalled);
                    }
                    true
                }
            }
        };

        let mut inner = self.inner.lock();
        if let Some(list) = inner.waiters.get_mut(name) {
            list.retain(|h| !Arc::ptr_eq(h, &handle));
            if list.is_empty() {
                inner.waiters.remove(name);
            }
        }

        result
    }
}

fn class_dict<'a>(
    dict: &'a mut Dict,
    project: &str,
    class: &str,
) -> &'a mut HashMap<String, Slot> {
    dict.entry(project.to_owned())
        .or_default()
        .entry(class.to_owned())
        .or_default()
}

fn signal(waiters: &mut HashMap<String, Vec<Arc<WaitHandle>>>, project: &str, class: &str, command: &str) {
    let name = format!("{project}.{class}.{command}");
    if let Some(handles) = waiters.get(&name) {
        for handle in handles {
            handle.signal();
        }
    }
}

fn split_name(name: &str) -> Option<(&str, &str, &str)> {
    let mut parts = name.splitn(3, '.');
    let project = parts.next()?;
    let class = parts.next()?;
    let command = parts.next()?;
    Some((project, class, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, i32)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_owned(), Value::I32(v)))
            .collect()
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = Store::new();
        store.put("a", "B", "C", args(&[("x", 1)]));

        match store.get("a.B.C").unwrap() {
            Slot::Single(a) => assert_eq!(a["x"], Value::I32(1)),
            _ => panic!("expected Single"),
        }
    }

    #[test]
    fn put_list_appends_in_order() {
        let store = Store::new();
        for i in 0..3 {
            store.put_list("a", "B", "C", args(&[("x", i)]));
        }

        match store.get("a.B.C").unwrap() {
            Slot::List(list) => {
                assert_eq!(list.len(), 3);
                assert_eq!(list[2]["x"], Value::I32(2));
            }
            _ => panic!("expected List"),
        }
    }

    #[test]
    fn put_map_indexes_by_key() {
        let store = Store::new();
        store.put_map("a", "B", "C", args(&[("x", 1)]), Value::U8(7));
        store.put_map("a", "B", "C", args(&[("x", 2)]), Value::U8(7));

        match store.get("a.B.C").unwrap() {
            Slot::Map(map) => {
                assert_eq!(map.len(), 1);
                assert_eq!(map[&Value::U8(7)]["x"], Value::I32(2));
            }
            _ => panic!("expected Map"),
        }
    }

    #[test]
    fn get_of_unknown_name_is_none() {
        let store = Store::new();
        assert!(store.get("a.B.C").is_none());
    }

    #[test]
    fn wait_for_times_out_without_a_put() {
        let store = Store::new();
        assert!(!store.wait_for("a.B.C", Some(Duration::from_millis(20))));
    }

    #[test]
    fn concurrent_wait_for_unblocks_on_put() {
        let store = Arc::new(Store::new());
        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || store.wait_for("a.B.C", Some(Duration::from_secs(1))))
        };

        std::thread::sleep(Duration::from_millis(100));
        store.put("a", "B", "C", args(&[("x", 1)]));

        assert!(waiter.join().unwrap());
    }
}
