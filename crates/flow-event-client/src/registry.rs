// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three-tier entity registry.
//!
//! Every record may reference an instance (one remote probe), a thread
//! inside that probe, and a flow tracked by that thread. All three are
//! created lazily the first time a record mentions them and are owned as a
//! tree: the registry owns instances, an instance owns its threads and
//! flows. Flows are the only tier with an eviction policy; instances live
//! until the connection is torn down.

use crate::token::TokenIndex;
use derive_more::Display;
use fnv::FnvHashMap;
use tracing::debug;

/// Well-known record fields the registry consumes. Everything else in a
/// record is opaque payload for the consumer.
pub mod fields {
    pub const ALIAS: &str = "alias";
    pub const SOURCE: &str = "source";
    pub const THREAD_ID: &str = "thread_id";
    pub const THREAD_TS_USEC: &str = "thread_ts_usec";
    pub const FLOW_ID: &str = "flow_id";
    pub const FLOW_SRC_LAST_PKT_TIME: &str = "flow_src_last_pkt_time";
    pub const FLOW_DST_LAST_PKT_TIME: &str = "flow_dst_last_pkt_time";
    pub const FLOW_IDLE_TIME: &str = "flow_idle_time";
    pub const DAEMON_EVENT_NAME: &str = "daemon_event_name";
    pub const FLOW_EVENT_NAME: &str = "flow_event_name";
}

/// Identifies one remote probe: `hash(alias) ^ hash(source)`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("0x{_0:08x}")]
pub struct InstanceKey(u32);

/// Identifies one flow within its instance: `hash(flow_id)`.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("0x{_0:08x}")]
pub struct FlowKey(u32);

/// Identifies one worker thread within its instance.
pub type ThreadKey = u64;

/// Multiplicative string hash (seed 5381, times 33 plus byte) over the raw
/// bytes.
fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &byte in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(u32::from(byte));
    }
    hash
}

pub fn instance_key(alias: &str, source: &str) -> InstanceKey {
    InstanceKey(hash_bytes(alias.as_bytes()) ^ hash_bytes(source.as_bytes()))
}

pub fn flow_key(flow_id: &str) -> FlowKey {
    FlowKey(hash_bytes(flow_id.as_bytes()))
}

/// Why a flow or an instance's flows were removed.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The daemon announced a (re)start; any flow state predating it is
    /// stale.
    #[display("daemon-init")]
    DaemonInit,
    #[display("daemon-shutdown")]
    DaemonShutdown,
    #[display("flow-end")]
    FlowEnd,
    #[display("flow-idle")]
    FlowIdle,
    /// The flow's declared idle budget elapsed relative to the most recent
    /// activity seen on its thread.
    #[display("flow-timeout")]
    FlowTimeout,
    #[display("app-shutdown")]
    AppShutdown,
}

/// Per-worker-thread state within an instance.
#[derive(Debug)]
pub struct ThreadData<T> {
    pub key: ThreadKey,
    /// Maximum timestamp observed across any flow reported by this thread.
    /// Monotonic non-decreasing; this is the logical clock flow timeouts are
    /// measured against.
    pub most_recent_flow_time: u64,
    /// Consumer payload.
    pub state: T,
}

/// State for one tracked network connection.
#[derive(Debug)]
pub struct Flow<F> {
    pub key: FlowKey,
    /// The numeric flow id as reported by the daemon.
    pub id: u64,
    /// Key of the thread that first reported this flow.
    pub thread_key: ThreadKey,
    /// Maximum of the two directions' last-packet timestamps seen so far.
    pub last_seen: u64,
    /// Declared inactivity threshold from the most recent record.
    pub idle_time: u64,
    /// Consumer payload.
    pub state: F,
}

impl<F> Flow<F> {
    /// Whether this flow's idle budget has elapsed relative to
    /// `most_recent_flow_time`. The boundary is strict: a flow whose budget
    /// ends exactly now is still alive.
    pub fn timed_out(&self, most_recent_flow_time: u64) -> bool {
        self.last_seen.saturating_add(self.idle_time) < most_recent_flow_time
    }
}

/// One remote probe and everything it owns.
#[derive(Debug)]
pub struct Instance<I, T, F> {
    pub key: InstanceKey,
    /// Consumer payload.
    pub state: I,
    pub threads: FnvHashMap<ThreadKey, ThreadData<T>>,
    pub flows: FnvHashMap<FlowKey, Flow<F>>,
}

impl<I, T, F> Instance<I, T, F> {
    /// Flows whose owning thread is missing, mismatched, or already past its
    /// timeout threshold. A healthy registry returns an empty list.
    pub fn inconsistent_flows(&self) -> Vec<FlowKey> {
        self.flows
            .values()
            .filter(|flow| match self.threads.get(&flow.thread_key) {
                None => true,
                Some(thread) => {
                    thread.key != flow.thread_key
                        || flow.timed_out(thread.most_recent_flow_time)
                }
            })
            .map(|flow| flow.key)
            .collect()
    }
}

/// Entity keys resolved from one record. `None` means the record does not
/// carry that tier's fields, which is normal for non-flow events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resolved {
    pub instance: Option<InstanceKey>,
    pub thread: Option<ThreadKey>,
    pub flow: Option<FlowKey>,
}

/// Notification passed to the cleanup hook while entities are being removed.
/// The referenced flow has already left its instance's map.
pub enum CleanupEvent<'a, I, T, F> {
    Instance {
        key: InstanceKey,
        state: &'a mut I,
        reason: CleanupReason,
    },
    Flow {
        key: InstanceKey,
        state: &'a mut I,
        thread: Option<&'a mut ThreadData<T>>,
        flow: &'a Flow<F>,
        reason: CleanupReason,
    },
}

/// Top-level map of instances, keyed by the alias/source hash.
#[derive(Debug)]
pub struct Registry<I, T, F> {
    instances: FnvHashMap<InstanceKey, Instance<I, T, F>>,
}

impl<I, T, F> Default for Registry<I, T, F> {
    fn default() -> Self {
        Self {
            instances: FnvHashMap::default(),
        }
    }
}

impl<I, T, F> Registry<I, T, F>
where
    I: Default,
    T: Default,
    F: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn get(&self, key: InstanceKey) -> Option<&Instance<I, T, F>> {
        self.instances.get(&key)
    }

    pub fn get_mut(&mut self, key: InstanceKey) -> Option<&mut Instance<I, T, F>> {
        self.instances.get_mut(&key)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance<I, T, F>> {
        self.instances.values()
    }

    /// Every (instance, owning thread, flow) triple currently tracked.
    pub fn iter_flows(
        &self,
    ) -> impl Iterator<Item = (&Instance<I, T, F>, Option<&ThreadData<T>>, &Flow<F>)> {
        self.instances.values().flat_map(|instance| {
            instance
                .flows
                .values()
                .map(move |flow| (instance, instance.threads.get(&flow.thread_key), flow))
        })
    }

    /// Resolve (and lazily create) the entities one record refers to, and
    /// apply its timestamp bookkeeping.
    ///
    /// A record without both `alias` and `source` resolves nothing; a record
    /// without a parseable `thread_id` resolves no thread and therefore no
    /// flow.
    pub fn resolve(&mut self, tokens: &TokenIndex) -> Resolved {
        let (Some(alias), Some(source)) =
            (tokens.get(fields::ALIAS), tokens.get(fields::SOURCE))
        else {
            return Resolved::default();
        };

        let key = instance_key(alias.value(), source.value());
        let instance = self.instances.entry(key).or_insert_with(|| {
            debug!(instance = %key, alias = alias.value(), source = source.value(), "new instance");
            Instance {
                key,
                state: I::default(),
                threads: FnvHashMap::default(),
                flows: FnvHashMap::default(),
            }
        });

        let Ok(thread_key) = tokens.value_as_u64(fields::THREAD_ID) else {
            return Resolved {
                instance: Some(key),
                ..Resolved::default()
            };
        };
        let thread = instance
            .threads
            .entry(thread_key)
            .or_insert_with(|| ThreadData {
                key: thread_key,
                most_recent_flow_time: 0,
                state: T::default(),
            });
        if let Ok(timestamp) = tokens.value_as_u64(fields::THREAD_TS_USEC) {
            if timestamp > thread.most_recent_flow_time {
                thread.most_recent_flow_time = timestamp;
            }
        }

        let Some(flow_id) = tokens.get(fields::FLOW_ID) else {
            return Resolved {
                instance: Some(key),
                thread: Some(thread_key),
                flow: None,
            };
        };
        let fkey = flow_key(flow_id.value());
        let flow = instance.flows.entry(fkey).or_insert_with(|| {
            debug!(instance = %key, flow = %fkey, thread = thread_key, "new flow");
            Flow {
                key: fkey,
                id: flow_id.value_as_u64().unwrap_or(0),
                thread_key,
                last_seen: 0,
                idle_time: 0,
                state: F::default(),
            }
        });

        for field in [fields::FLOW_SRC_LAST_PKT_TIME, fields::FLOW_DST_LAST_PKT_TIME] {
            if let Ok(timestamp) = tokens.value_as_u64(field) {
                if timestamp > flow.last_seen {
                    flow.last_seen = timestamp;
                }
            }
        }
        if let Ok(idle_time) = tokens.value_as_u64(fields::FLOW_IDLE_TIME) {
            flow.idle_time = idle_time;
        }

        Resolved {
            instance: Some(key),
            thread: Some(thread_key),
            flow: Some(fkey),
        }
    }

    /// Remove one flow, notifying the hook before it is dropped.
    pub fn evict_flow(
        &mut self,
        instance: InstanceKey,
        flow: FlowKey,
        reason: CleanupReason,
        mut hook: impl FnMut(CleanupEvent<'_, I, T, F>),
    ) {
        let Some(entry) = self.instances.get_mut(&instance) else {
            return;
        };
        let Some(flow) = entry.flows.remove(&flow) else {
            return;
        };
        debug!(instance = %instance, flow = %flow.key, reason = %reason, "evicting flow");
        hook(CleanupEvent::Flow {
            key: entry.key,
            state: &mut entry.state,
            thread: entry.threads.get_mut(&flow.thread_key),
            flow: &flow,
            reason,
        });
    }

    /// Remove every flow owned by one thread, notifying the hook per flow.
    pub fn evict_thread_flows(
        &mut self,
        instance: InstanceKey,
        thread: ThreadKey,
        reason: CleanupReason,
        mut hook: impl FnMut(CleanupEvent<'_, I, T, F>),
    ) {
        let Some(entry) = self.instances.get_mut(&instance) else {
            return;
        };
        let keys: Vec<FlowKey> = entry
            .flows
            .values()
            .filter(|flow| flow.thread_key == thread)
            .map(|flow| flow.key)
            .collect();
        if keys.is_empty() {
            return;
        }
        debug!(instance = %instance, thread, reason = %reason, count = keys.len(), "evicting thread flows");
        for key in keys {
            let Some(flow) = entry.flows.remove(&key) else {
                continue;
            };
            hook(CleanupEvent::Flow {
                key: entry.key,
                state: &mut entry.state,
                thread: entry.threads.get_mut(&flow.thread_key),
                flow: &flow,
                reason,
            });
        }
    }

    /// Tear down every instance and everything it owns. The instance hook
    /// fires before its flows are swept.
    pub fn teardown(
        &mut self,
        reason: CleanupReason,
        mut hook: impl FnMut(CleanupEvent<'_, I, T, F>),
    ) {
        let keys: Vec<InstanceKey> = self.instances.keys().copied().collect();
        for key in keys {
            let Some(mut entry) = self.instances.remove(&key) else {
                continue;
            };
            debug!(instance = %key, reason = %reason, "tearing down instance");
            hook(CleanupEvent::Instance {
                key: entry.key,
                state: &mut entry.state,
                reason,
            });

            let flow_keys: Vec<FlowKey> = entry.flows.keys().copied().collect();
            for flow_key in flow_keys {
                let Some(flow) = entry.flows.remove(&flow_key) else {
                    continue;
                };
                hook(CleanupEvent::Flow {
                    key: entry.key,
                    state: &mut entry.state,
                    thread: entry.threads.get_mut(&flow.thread_key),
                    flow: &flow,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    type TestRegistry = Registry<(), (), ()>;

    fn tokens_for(json: &str) -> TokenIndex {
        let mut tokens = TokenIndex::new();
        tokens.index_record(json.as_bytes()).unwrap();
        tokens
    }

    #[test]
    fn test_instance_key_is_stable_and_distinct() {
        let a = instance_key("probe0", "eth0");
        let b = instance_key("probe0", "eth0");
        assert_eq!(a, b);

        assert_ne!(instance_key("probe0", "eth1"), a);
        assert_ne!(instance_key("probe1", "eth0"), a);
    }

    #[test]
    fn test_resolution_creates_all_tiers() {
        let mut registry = TestRegistry::new();
        let tokens = tokens_for(
            r#"{"alias":"probe0","source":"eth0","thread_id":2,"flow_id":"17","flow_src_last_pkt_time":1000}"#,
        );

        let resolved = registry.resolve(&tokens);
        let instance = registry.get(resolved.instance.unwrap()).unwrap();
        assert_eq!(instance.threads.len(), 1);
        assert_eq!(instance.flows.len(), 1);

        let flow = &instance.flows[&resolved.flow.unwrap()];
        assert_eq!(flow.id, 17);
        assert_eq!(flow.thread_key, 2);
        assert_eq!(flow.last_seen, 1000);
    }

    #[test]
    fn test_resolution_without_alias_or_source() {
        let mut registry = TestRegistry::new();
        let tokens = tokens_for(r#"{"alias":"probe0","thread_id":2,"flow_id":"17"}"#);
        assert_eq!(registry.resolve(&tokens), Resolved::default());
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn test_resolution_without_thread_resolves_no_flow() {
        let mut registry = TestRegistry::new();
        let tokens = tokens_for(r#"{"alias":"probe0","source":"eth0","flow_id":"17"}"#);
        let resolved = registry.resolve(&tokens);
        assert!(resolved.instance.is_some());
        assert!(resolved.thread.is_none());
        assert!(resolved.flow.is_none());
    }

    #[test]
    fn test_last_seen_takes_maximum_of_both_directions() {
        let mut registry = TestRegistry::new();
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"5","flow_src_last_pkt_time":900,"flow_dst_last_pkt_time":1200}"#,
        ));
        let resolved = registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"5","flow_src_last_pkt_time":1100}"#,
        ));

        let instance = registry.get(resolved.instance.unwrap()).unwrap();
        let flow = &instance.flows[&resolved.flow.unwrap()];
        // The running maximum must not regress to the lower update.
        assert_eq!(flow.last_seen, 1200);
    }

    #[test]
    fn test_idle_time_is_last_write_wins() {
        let mut registry = TestRegistry::new();
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"5","flow_idle_time":600}"#,
        ));
        let resolved = registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"5","flow_idle_time":100}"#,
        ));

        let instance = registry.get(resolved.instance.unwrap()).unwrap();
        assert_eq!(instance.flows[&resolved.flow.unwrap()].idle_time, 100);
    }

    #[test]
    fn test_most_recent_flow_time_is_monotonic() {
        let mut registry = TestRegistry::new();
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"thread_ts_usec":5000}"#,
        ));
        let resolved = registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"thread_ts_usec":4000}"#,
        ));

        let instance = registry.get(resolved.instance.unwrap()).unwrap();
        assert_eq!(instance.threads[&1].most_recent_flow_time, 5000);
    }

    #[test]
    fn test_timed_out_boundary_is_strict() {
        let flow = Flow {
            key: flow_key("1"),
            id: 1,
            thread_key: 0,
            last_seen: 1000,
            idle_time: 500,
            state: (),
        };
        assert!(!flow.timed_out(1500));
        assert!(flow.timed_out(1501));
    }

    #[test]
    fn test_timed_out_saturates() {
        let flow = Flow {
            key: flow_key("1"),
            id: 1,
            thread_key: 0,
            last_seen: 10,
            idle_time: u64::MAX,
            state: (),
        };
        assert!(!flow.timed_out(u64::MAX));
    }

    #[test]
    fn test_evict_thread_flows_spares_other_threads() {
        let mut registry = TestRegistry::new();
        let resolved = registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"10"}"#,
        ));
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":2,"flow_id":"20"}"#,
        ));
        let instance_key = resolved.instance.unwrap();

        let mut evicted = Vec::new();
        registry.evict_thread_flows(instance_key, 1, CleanupReason::DaemonInit, |event| {
            if let CleanupEvent::Flow { flow, reason, .. } = event {
                evicted.push((flow.id, reason));
            }
        });

        assert_eq!(evicted, vec![(10, CleanupReason::DaemonInit)]);
        assert_eq!(registry.get(instance_key).unwrap().flows.len(), 1);
    }

    #[test]
    fn test_teardown_fires_instance_hook_before_flows() {
        let mut registry = TestRegistry::new();
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"10"}"#,
        ));

        let mut order = Vec::new();
        registry.teardown(CleanupReason::AppShutdown, |event| match event {
            CleanupEvent::Instance { reason, .. } => order.push(format!("instance:{reason}")),
            CleanupEvent::Flow { reason, .. } => order.push(format!("flow:{reason}")),
        });

        assert_eq!(order, vec!["instance:app-shutdown", "flow:app-shutdown"]);
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn test_inconsistent_flows() {
        let mut registry = TestRegistry::new();
        let resolved = registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"flow_id":"10","flow_src_last_pkt_time":100,"flow_idle_time":50}"#,
        ));
        let instance_key = resolved.instance.unwrap();
        assert!(registry.get(instance_key).unwrap().inconsistent_flows().is_empty());

        // Advance the thread's logical clock past the flow's idle budget
        // without touching the flow itself.
        registry.resolve(&tokens_for(
            r#"{"alias":"p","source":"s","thread_id":1,"thread_ts_usec":200}"#,
        ));
        let stale = registry.get(instance_key).unwrap().inconsistent_flows();
        assert_eq!(stale, vec![resolved.flow.unwrap()]);
    }
}
