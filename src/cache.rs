/*
 * Copyright 2025 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use futures::StreamExt;

use crate::{
    metrics,
    resources::{GameServer, GameServerState, SchedulingStrategy},
    store::{Event, Store},
};

/// A locally-indexed view of every game server's current lifecycle state,
/// partitioned by owning set and by node, kept current by a single
/// feed-consumer task ([`AllocationCache::drive`]).
///
/// The cache is advisory: it may transiently show a server as a candidate
/// after the server was allocated elsewhere. The allocator's conditional
/// commit against the authoritative store resolves that, never the cache.
#[derive(Debug)]
pub struct AllocationCache {
    sets: DashMap<String, SetShard>,
    tracked: DashMap<String, Tracked>,
    synced: AtomicBool,
    changes: tokio::sync::watch::Sender<()>,
}

/// Last applied placement for one object, used to undo its previous index
/// entry on update and to drop stale feed events.
#[derive(Debug)]
struct Tracked {
    version: u64,
    set: Option<String>,
    node: Option<String>,
    state: GameServerState,
}

#[derive(Debug, Default)]
struct SetShard {
    nodes: BTreeMap<String, NodeBucket>,
    counts: SetCounts,
}

#[derive(Debug, Default)]
struct NodeBucket {
    /// `Ready`/`Reserved` servers, name-ordered for deterministic tie-breaks.
    candidates: BTreeMap<String, Arc<GameServer>>,
    /// Names of `Allocated` servers; their count is the node's occupancy.
    allocated: BTreeSet<String>,
}

/// Per-set lifecycle counters as currently seen by the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetCounts {
    /// Servers still before `Ready` (pending creation).
    pub pending: u32,
    pub ready: u32,
    pub reserved: u32,
    pub allocated: u32,
}

impl SetCounts {
    /// Non-allocated capacity: `Ready`, `Reserved` and pending servers.
    pub fn standby(&self) -> u32 {
        self.pending + self.ready + self.reserved
    }

    pub fn total(&self) -> u32 {
        self.standby() + self.allocated
    }
}

impl Default for AllocationCache {
    fn default() -> Self {
        Self {
            sets: <_>::default(),
            tracked: <_>::default(),
            synced: AtomicBool::new(false),
            changes: tokio::sync::watch::channel(()).0,
        }
    }
}

impl AllocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the initial full listing has been applied. Consumers that
    /// need complete counts (the reconciler) wait for this before acting.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// A receiver notified on every applied change, used to re-trigger
    /// reconciliation without polling.
    pub fn changes(&self) -> tokio::sync::watch::Receiver<()> {
        self.changes.subscribe()
    }

    /// Applies one feed event. Events are applied in per-object version
    /// order; a stale or duplicate event is dropped, counted, and returns
    /// `false`. Only the feed-consumer task writes here.
    pub fn apply(&self, gs: GameServer) -> bool {
        let name = gs.name().to_owned();
        if name.is_empty() {
            return false;
        }

        let version = gs.version();
        if let Some(existing) = self.tracked.get(&name) {
            if version <= existing.version {
                metrics::cache_events_total("stale").inc();
                return false;
            }
        }

        if let Some(previous) = self.tracked.insert(name.clone(), Tracked::new(&gs, version)) {
            self.remove_placement(&name, &previous);
        }
        self.insert_placement(&name, gs);

        metrics::cache_events_total("apply").inc();
        self.changes.send_replace(());
        true
    }

    pub fn delete(&self, gs: &GameServer) {
        if let Some((name, tracked)) = self.tracked.remove(gs.name()) {
            self.remove_placement(&name, &tracked);
            metrics::cache_events_total("delete").inc();
            self.changes.send_replace(());
        }
    }

    /// Replaces the whole index with a fresh full listing. Feed continuity is
    /// never assumed across an interruption, so every (re)opened watch leads
    /// here before deltas resume.
    pub fn resync(&self, list: Vec<GameServer>) {
        self.sets.clear();
        self.tracked.clear();

        for gs in list {
            let name = gs.name().to_owned();
            if name.is_empty() {
                continue;
            }
            self.tracked
                .insert(name.clone(), Tracked::new(&gs, gs.version()));
            self.insert_placement(&name, gs);
        }

        self.synced.store(true, Ordering::SeqCst);
        metrics::cache_events_total("resync").inc();
        self.changes.send_replace(());
    }

    pub fn counts(&self, set: &str) -> SetCounts {
        self.sets
            .get(set)
            .map(|shard| shard.counts)
            .unwrap_or_default()
    }

    /// Candidate servers for an allocation out of `set`, in strategy order:
    /// `Packed` walks nodes by occupancy descending, `Distributed`
    /// round-robins across nodes. All ties are broken by name.
    pub fn candidates(&self, set: &str, strategy: SchedulingStrategy) -> Vec<Arc<GameServer>> {
        let mut nodes: Vec<(String, usize, Vec<Arc<GameServer>>)> = {
            let Some(shard) = self.sets.get(set) else {
                return Vec::new();
            };
            shard
                .nodes
                .iter()
                .filter(|(_, bucket)| !bucket.candidates.is_empty())
                .map(|(node, bucket)| {
                    (
                        node.clone(),
                        bucket.allocated.len(),
                        bucket.candidates.values().cloned().collect(),
                    )
                })
                .collect()
        };

        match strategy {
            SchedulingStrategy::Packed => {
                nodes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                nodes
                    .into_iter()
                    .flat_map(|(_, _, candidates)| candidates)
                    .collect()
            }
            SchedulingStrategy::Distributed => {
                nodes.sort_by(|a, b| a.0.cmp(&b.0));
                let mut queues: Vec<VecDeque<Arc<GameServer>>> = nodes
                    .into_iter()
                    .map(|(_, _, candidates)| candidates.into())
                    .collect();

                let mut ordered = Vec::with_capacity(queues.iter().map(VecDeque::len).sum());
                while !queues.is_empty() {
                    queues.retain_mut(|queue| {
                        if let Some(gs) = queue.pop_front() {
                            ordered.push(gs);
                        }
                        !queue.is_empty()
                    });
                }
                ordered
            }
        }
    }

    /// Consumes the store's change feed until shutdown. A feed error returns
    /// to the supervisor, which restarts the task; the re-opened watch then
    /// delivers a fresh full listing.
    pub async fn drive(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        mut shutdown: crate::signal::ShutdownRx,
    ) -> crate::Result<()> {
        let mut events = store.watch_gameservers();

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                event = events.next() => event,
            };

            match event {
                Some(Ok(Event::Applied(gs))) => {
                    self.apply(gs);
                }
                Some(Ok(Event::Deleted(gs))) => self.delete(&gs),
                Some(Ok(Event::Restarted(list))) => self.resync(list),
                Some(Err(error)) => return Err(error.into()),
                None => return Err(eyre::eyre!("game server watch stream terminated")),
            }
        }
    }

    fn insert_placement(&self, name: &str, gs: GameServer) {
        let Some(set) = gs.set_name().map(str::to_owned) else {
            return;
        };
        let state = gs.state().unwrap_or(GameServerState::PortAllocation);
        let node = gs.node_name().map(str::to_owned);

        let mut shard = self.sets.entry(set).or_default();
        bump(&mut shard.counts, state, 1);

        if let Some(node) = node {
            let bucket = shard.nodes.entry(node).or_default();
            if state.is_allocatable() {
                bucket.candidates.insert(name.to_owned(), Arc::new(gs));
            } else if state == GameServerState::Allocated {
                bucket.allocated.insert(name.to_owned());
            }
        }
    }

    fn remove_placement(&self, name: &str, tracked: &Tracked) {
        let Some(set) = &tracked.set else {
            return;
        };
        let Some(mut shard) = self.sets.get_mut(set) else {
            return;
        };

        bump(&mut shard.counts, tracked.state, -1);

        if let Some(node) = &tracked.node {
            if let Some(bucket) = shard.nodes.get_mut(node) {
                bucket.candidates.remove(name);
                bucket.allocated.remove(name);
                if bucket.candidates.is_empty() && bucket.allocated.is_empty() {
                    shard.nodes.remove(node);
                }
            }
        }

        let empty = shard.nodes.is_empty() && shard.counts == SetCounts::default();
        drop(shard);
        if empty {
            self.sets.remove_if(set, |_, shard| {
                shard.nodes.is_empty() && shard.counts == SetCounts::default()
            });
        }
    }
}

impl Tracked {
    fn new(gs: &GameServer, version: u64) -> Self {
        Self {
            version,
            set: gs.set_name().map(str::to_owned),
            node: gs.node_name().map(str::to_owned),
            state: gs.state().unwrap_or(GameServerState::PortAllocation),
        }
    }
}

fn bump(counts: &mut SetCounts, state: GameServerState, delta: i32) {
    let slot = match state {
        state if state.is_pending() => &mut counts.pending,
        GameServerState::Ready => &mut counts.ready,
        GameServerState::Reserved => &mut counts.reserved,
        GameServerState::Allocated => &mut counts.allocated,
        // Terminal servers are not capacity.
        _ => return,
    };
    *slot = slot.saturating_add_signed(delta);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{gameserver, gameserver_on};
    use pretty_assertions::assert_eq;

    fn named(cache: &AllocationCache, set: &str, strategy: SchedulingStrategy) -> Vec<String> {
        cache
            .candidates(set, strategy)
            .iter()
            .map(|gs| gs.name().to_owned())
            .collect()
    }

    #[test]
    fn packed_prefers_the_most_occupied_node() {
        let cache = AllocationCache::new();
        cache.resync(vec![
            gameserver_on("gs-a", "set-1", "node-quiet", GameServerState::Ready),
            gameserver_on("gs-b", "set-1", "node-busy", GameServerState::Ready),
            gameserver_on("gs-c", "set-1", "node-busy", GameServerState::Allocated),
        ]);

        assert_eq!(
            named(&cache, "set-1", SchedulingStrategy::Packed),
            vec!["gs-b", "gs-a"]
        );
    }

    #[test]
    fn packed_breaks_occupancy_ties_by_node_then_name() {
        let cache = AllocationCache::new();
        cache.resync(vec![
            gameserver_on("gs-d", "set-1", "node-2", GameServerState::Ready),
            gameserver_on("gs-c", "set-1", "node-2", GameServerState::Ready),
            gameserver_on("gs-b", "set-1", "node-1", GameServerState::Ready),
        ]);

        assert_eq!(
            named(&cache, "set-1", SchedulingStrategy::Packed),
            vec!["gs-b", "gs-c", "gs-d"]
        );
    }

    #[test]
    fn distributed_round_robins_across_nodes() {
        let cache = AllocationCache::new();
        cache.resync(vec![
            gameserver_on("gs-a", "set-1", "node-1", GameServerState::Ready),
            gameserver_on("gs-b", "set-1", "node-1", GameServerState::Ready),
            gameserver_on("gs-c", "set-1", "node-2", GameServerState::Ready),
            gameserver_on("gs-d", "set-1", "node-3", GameServerState::Ready),
        ]);

        assert_eq!(
            named(&cache, "set-1", SchedulingStrategy::Distributed),
            vec!["gs-a", "gs-c", "gs-d", "gs-b"]
        );
    }

    #[test]
    fn stale_events_are_dropped_per_object() {
        let cache = AllocationCache::new();
        let mut newer = gameserver_on("gs-a", "set-1", "node-1", GameServerState::Allocated);
        newer.metadata.resource_version = Some("7".into());
        assert!(cache.apply(newer));

        // A delayed event from before the allocation must not resurrect the
        // candidate entry.
        let mut stale = gameserver_on("gs-a", "set-1", "node-1", GameServerState::Ready);
        stale.metadata.resource_version = Some("3".into());
        assert!(!cache.apply(stale));

        assert!(named(&cache, "set-1", SchedulingStrategy::Packed).is_empty());
        assert_eq!(cache.counts("set-1").allocated, 1);
    }

    #[test]
    fn counts_follow_state_changes() {
        let cache = AllocationCache::new();
        let mut gs = gameserver_on("gs-a", "set-1", "node-1", GameServerState::Ready);
        gs.metadata.resource_version = Some("1".into());
        cache.apply(gs.clone());
        assert_eq!(cache.counts("set-1").ready, 1);

        gs.metadata.resource_version = Some("2".into());
        gs.status.as_mut().unwrap().state = GameServerState::Allocated;
        cache.apply(gs.clone());

        let counts = cache.counts("set-1");
        assert_eq!((counts.ready, counts.allocated), (0, 1));

        cache.delete(&gs);
        assert_eq!(cache.counts("set-1"), SetCounts::default());
    }

    #[test]
    fn servers_without_a_node_count_but_are_not_candidates() {
        let cache = AllocationCache::new();
        cache.resync(vec![gameserver("gs-a", "set-1", GameServerState::Ready)]);

        assert!(named(&cache, "set-1", SchedulingStrategy::Packed).is_empty());
        assert_eq!(cache.counts("set-1").ready, 1);
    }
}
