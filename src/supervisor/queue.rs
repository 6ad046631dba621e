// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Supervisor (§4.E): a min-heap of service checks ordered by next-due time.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::supervisor::probe::ProbeRegistry;

/// Liveness result of the most recent check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LastStatus {
    /// Never checked yet.
    Unknown,
    /// Last check succeeded.
    Ok,
    /// Last check failed.
    Fail,
}

impl LastStatus {
    /// Numeric encoding used in the `getresults()` JSON snapshot.
    pub fn as_int(self) -> i32 {
        match self {
            LastStatus::Unknown => -1,
            LastStatus::Ok => 1,
            LastStatus::Fail => 0,
        }
    }
}

/// One service under supervision.
#[derive(Clone, Debug)]
pub struct ServiceDescriptor {
    /// `<group>/<key>`, unique across the queue.
    pub uid: String,
    /// Protocol tag, matched uppercase against the probe registry.
    pub protocol: String,
    /// Target host.
    pub host: String,
    /// Target port.
    pub port: u16,
    /// Per-check timeout, seconds.
    pub timeout: u64,
    /// Expected result pattern (HTTP status code for the reference probe).
    pub pattern: u16,
    /// Seconds between checks.
    pub interval: u64,
    /// Epoch seconds of the most recent dispatch.
    pub lastschedule: u64,
    /// Result of the most recent check.
    pub laststatus: LastStatus,
    /// Seen in the most recent reconciliation pass.
    pub fresh: bool,
}

impl ServiceDescriptor {
    fn due(&self) -> u64 {
        self.lastschedule.saturating_add(self.interval)
    }
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

struct State {
    entries: HashMap<String, ServiceDescriptor>,
    heap: BinaryHeap<Reverse<(u64, String)>>,
}

/// Min-heap scheduler of service health checks, guarded by a single lock (§5).
pub struct Supervisor {
    state: Mutex<State>,
    probes: Arc<ProbeRegistry>,
    checks_dispatched: AtomicU64,
}

impl Supervisor {
    /// Construct an empty supervisor against the given probe registry.
    pub fn new(probes: Arc<ProbeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State { entries: HashMap::new(), heap: BinaryHeap::new() }),
            probes,
            checks_dispatched: AtomicU64::new(0),
        })
    }

    /// Insert or update a service, per §4.E. Updating an existing `uid` does not
    /// reschedule its `lastschedule`; it only refreshes the mutable fields and
    /// marks the entry fresh.
    pub fn queueservice(
        &self,
        uid: &str,
        protocol: &str,
        host: &str,
        port: u16,
        timeout: u64,
        pattern: u16,
        interval: u64,
    ) {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        if let Some(existing) = state.entries.get_mut(uid) {
            existing.protocol = protocol.to_uppercase();
            existing.host = host.to_string();
            existing.port = port;
            existing.timeout = timeout;
            existing.pattern = pattern;
            existing.interval = interval;
            existing.fresh = true;
            return;
        }

        let descriptor = ServiceDescriptor {
            uid: uid.to_string(),
            protocol: protocol.to_uppercase(),
            host: host.to_string(),
            port,
            timeout,
            pattern,
            interval,
            lastschedule: now_epoch(),
            laststatus: LastStatus::Unknown,
            fresh: true,
        };
        state.heap.push(Reverse((descriptor.due(), descriptor.uid.clone())));
        state.entries.insert(uid.to_string(), descriptor);
    }

    /// Pop the due entry (if any) and dispatch its probe. Lazily discards stale
    /// heap entries left behind by in-place updates.
    pub fn checkservice(self: &Arc<Self>) {
        let descriptor = {
            let mut state = self.state.lock().expect("supervisor lock poisoned");
            loop {
                let Some(Reverse((due, uid))) = state.heap.pop() else {
                    return;
                };
                match state.entries.get(&uid) {
                    Some(entry) if entry.due() == due => {}
                    _ => continue, // stale: removed by reconciliation, or superseded by an update
                }
                let entry = state.entries.get_mut(&uid).expect("checked above");
                entry.lastschedule = now_epoch();
                let new_due = entry.due();
                let snapshot = entry.clone();
                state.heap.push(Reverse((new_due, uid)));
                break snapshot;
            }
        };

        self.checks_dispatched.fetch_add(1, Ordering::Relaxed);
        let Some(probe) = self.probes.get(&descriptor.protocol) else {
            self.set_laststatus(&descriptor.uid, LastStatus::Fail);
            return;
        };
        let supervisor = self.clone();
        probe.police(descriptor, supervisor);
    }

    /// Record the outcome of an in-flight check.
    pub fn set_laststatus(&self, uid: &str, status: LastStatus) {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        if let Some(entry) = state.entries.get_mut(uid) {
            entry.laststatus = status;
        }
    }

    /// Change an entry's check interval. The already-queued heap slot for this
    /// cycle still fires once more, but `checkservice`'s staleness check
    /// (`entry.due() == due`) will then disagree with the now-stale heap key
    /// and discard it without dispatching, so a sufficiently large interval
    /// (e.g. `u64::MAX`) makes this entry effectively one-shot.
    pub fn set_interval(&self, uid: &str, interval: u64) {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        if let Some(entry) = state.entries.get_mut(uid) {
            entry.interval = interval;
        }
    }

    /// Due time of the head of the queue, or now if the queue is empty.
    pub fn getnextschedule(&self) -> u64 {
        let state = self.state.lock().expect("supervisor lock poisoned");
        state
            .heap
            .peek()
            .map(|Reverse((due, _))| *due)
            .unwrap_or_else(now_epoch)
    }

    /// Mark-and-sweep reconciliation for one group (§4.E): entries under
    /// `<group>/` not seen `fresh` since the last pass are dropped; the rest
    /// have their `fresh` flag reset for the next pass.
    pub fn removeobsoleteservices(&self, group: &str) {
        let prefix = format!("{group}/");
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(uid, d)| uid.starts_with(&prefix) && !d.fresh)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in stale {
            state.entries.remove(&uid);
        }
        for (uid, d) in state.entries.iter_mut() {
            if uid.starts_with(&prefix) {
                d.fresh = false;
            }
        }
    }

    /// A snapshot of all entries, as used to populate the results store.
    pub fn getresults(&self) -> serde_json::Value {
        let state = self.state.lock().expect("supervisor lock poisoned");
        let results: Vec<serde_json::Value> = state
            .entries
            .values()
            .map(|d| {
                serde_json::json!([d.uid, d.lastschedule, d.laststatus.as_int(), d.timeout])
            })
            .collect();
        serde_json::json!({ "results": results })
    }

    /// Number of entries currently queued (diagnostic/metrics use).
    pub fn len(&self) -> usize {
        self.state.lock().expect("supervisor lock poisoned").entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::probe::ProbeRegistry;

    fn supervisor() -> Arc<Supervisor> {
        Supervisor::new(Arc::new(ProbeRegistry::with_defaults()))
    }

    #[test]
    fn requeueing_same_uid_does_not_reset_lastschedule() {
        let sup = supervisor();
        sup.queueservice("g/a", "HTTP", "example.com", 80, 5, 200, 60);
        let first_schedule = {
            let state = sup.state.lock().unwrap();
            state.entries.get("g/a").unwrap().lastschedule
        };
        sup.queueservice("g/a", "HTTP", "example.com", 81, 5, 200, 60);
        let state = sup.state.lock().unwrap();
        let entry = state.entries.get("g/a").unwrap();
        assert_eq!(entry.lastschedule, first_schedule);
        assert_eq!(entry.port, 81);
        assert!(entry.fresh);
    }

    #[test]
    fn reconciliation_drops_unseen_entries_and_resets_fresh() {
        let sup = supervisor();
        sup.queueservice("g/a", "HTTP", "h", 80, 5, 200, 60);
        sup.queueservice("g/b", "HTTP", "h", 80, 5, 200, 60);
        // simulate a pass that only re-saw "g/a"
        {
            let mut state = sup.state.lock().unwrap();
            state.entries.get_mut("g/b").unwrap().fresh = false;
        }
        sup.removeobsoleteservices("g");
        let state = sup.state.lock().unwrap();
        assert!(state.entries.contains_key("g/a"));
        assert!(!state.entries.contains_key("g/b"));
        assert!(!state.entries.get("g/a").unwrap().fresh);
    }

    #[test]
    fn set_interval_updates_due_computation() {
        let sup = supervisor();
        sup.queueservice("g/a", "SMTP", "h", 25, 5, 200, 60);
        sup.set_interval("g/a", u64::MAX);
        let state = sup.state.lock().unwrap();
        let entry = state.entries.get("g/a").unwrap();
        assert_eq!(entry.interval, u64::MAX);
        assert_eq!(entry.due(), u64::MAX); // saturating_add, effectively never due again
    }

    #[test]
    fn getnextschedule_is_now_when_empty() {
        let sup = supervisor();
        assert!(sup.getnextschedule() <= now_epoch());
    }
}
