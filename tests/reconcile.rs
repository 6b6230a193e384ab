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

use std::{sync::Arc, time::Duration};

use billet::{
    cache::AllocationCache,
    reconcile::{FleetReconciler, SetCatalog},
    resources::{AllocationOverflow, GameServerSet, GameServerState},
    store::Store,
    test_utils::{gameserver, gameserver_on, gameserver_set, InMemoryStore},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

struct Fixture {
    store: Arc<InMemoryStore>,
    cache: Arc<AllocationCache>,
    sets: Arc<SetCatalog>,
    reconciler: FleetReconciler,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(AllocationCache::new());
    let sets = Arc::new(SetCatalog::new());
    let reconciler = FleetReconciler::new(
        store.clone() as Arc<dyn Store>,
        cache.clone(),
        sets.clone(),
        Duration::from_secs(30),
    );

    Fixture {
        store,
        cache,
        sets,
        reconciler,
    }
}

impl Fixture {
    /// Brings the cache up to date with the store and runs one pass, the way
    /// the running system interleaves feed consumption and reconciliation.
    async fn pass(&self) {
        self.cache
            .resync(self.store.list_gameservers().await.unwrap());
        self.reconciler.reconcile_once().await;
    }

    fn states(&self) -> Vec<(String, GameServerState)> {
        self.store
            .gameservers()
            .iter()
            .map(|gs| (gs.name().to_owned(), gs.state().unwrap()))
            .collect()
    }
}

fn drain_policy() -> AllocationOverflow {
    AllocationOverflow {
        labels: [("tier".to_owned(), "drain".to_owned())].into(),
        annotations: Default::default(),
    }
}

fn set_with_overflow(name: &str, replicas: u32) -> GameServerSet {
    let mut set = gameserver_set(name, replicas);
    set.spec.allocation_overflow = Some(drain_policy());
    set
}

#[tokio::test]
async fn scale_up_creates_missing_servers() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 3));

    fixture.pass().await;

    let servers = fixture.store.gameservers();
    assert_eq!(servers.len(), 3);
    for gs in &servers {
        assert_eq!(gs.set_name(), Some("set-1"));
        assert_eq!(gs.state(), Some(GameServerState::PortAllocation));
        assert!(gs.name().starts_with("set-1-"));
    }

    // A second pass over the synced cache creates nothing further.
    fixture.pass().await;
    assert_eq!(fixture.store.gameservers().len(), 3);
}

#[tokio::test]
async fn scale_down_deletes_least_ready_first_and_never_allocated() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 1));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-live",
        "set-1",
        "node-1",
        GameServerState::Allocated,
    ));
    fixture
        .store
        .seed_gameserver(gameserver_on("gs-ready", "set-1", "node-1", GameServerState::Ready));
    fixture
        .store
        .seed_gameserver(gameserver("gs-pending", "set-1", GameServerState::PortAllocation));

    fixture.pass().await;

    // Excess of 2: the pending server goes before the ready one, and the
    // allocated one is untouchable.
    assert_eq!(
        fixture.states(),
        vec![("gs-live".to_owned(), GameServerState::Allocated)]
    );
}

#[tokio::test]
async fn reserved_servers_survive_scale_down() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 0));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-reserved",
        "set-1",
        "node-1",
        GameServerState::Reserved,
    ));
    fixture
        .store
        .seed_gameserver(gameserver_on("gs-ready", "set-1", "node-1", GameServerState::Ready));

    fixture.pass().await;

    assert_eq!(
        fixture.states(),
        vec![("gs-reserved".to_owned(), GameServerState::Reserved)]
    );
}

#[tokio::test]
async fn overflow_marks_unmatched_allocated_servers_without_deleting() {
    let fixture = fixture();
    fixture.sets.apply(set_with_overflow("set-1", 2));
    for index in 0..4 {
        fixture.store.seed_gameserver(gameserver_on(
            &format!("gs-{index}"),
            "set-1",
            "node-1",
            GameServerState::Allocated,
        ));
    }
    fixture
        .store
        .seed_gameserver(gameserver_on("gs-ready", "set-1", "node-1", GameServerState::Ready));

    let before = fixture.store.gameservers();
    let (matched, unmatched) = drain_policy().count_matches(&before);
    assert_eq!((matched, unmatched.len()), (0, 4));

    fixture.pass().await;

    // Every allocated server is marked, nothing is deleted, and the ready
    // server is left alone while the set runs above target.
    let after = fixture.store.gameservers();
    assert_eq!(after.len(), 5);
    let (matched, unmatched) = drain_policy().count_matches(&after);
    assert_eq!((matched, unmatched.len()), (4, 0));
    for gs in after.iter().filter(|gs| gs.is_allocated()) {
        assert_eq!(
            gs.metadata
                .labels
                .as_ref()
                .unwrap()
                .get("tier")
                .map(String::as_str),
            Some("drain")
        );
    }
    assert!(fixture.store.gameserver("gs-ready").is_some());
}

#[tokio::test]
async fn overflow_marking_is_stable_across_passes() {
    let fixture = fixture();
    fixture.sets.apply(set_with_overflow("set-1", 1));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-0",
        "set-1",
        "node-1",
        GameServerState::Allocated,
    ));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-1",
        "set-1",
        "node-1",
        GameServerState::Allocated,
    ));

    fixture.pass().await;
    let once = fixture.store.gameservers();
    fixture.pass().await;
    let twice = fixture.store.gameservers();

    for (a, b) in once.iter().zip(twice.iter()) {
        assert_eq!(a.metadata.labels, b.metadata.labels);
        assert_eq!(a.metadata.annotations, b.metadata.annotations);
    }
}

#[tokio::test]
async fn overflow_without_a_policy_is_reported_and_left_alone() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 1));
    for index in 0..3 {
        fixture.store.seed_gameserver(gameserver_on(
            &format!("gs-{index}"),
            "set-1",
            "node-1",
            GameServerState::Allocated,
        ));
    }

    fixture.pass().await;

    // No forced eviction, no marking: the condition is only reported.
    let servers = fixture.store.gameservers();
    assert_eq!(servers.len(), 3);
    for gs in &servers {
        assert_eq!(gs.state(), Some(GameServerState::Allocated));
        assert_eq!(
            gs.metadata.labels.as_ref().unwrap().get("tier"),
            None
        );
    }
}

#[tokio::test]
async fn finished_servers_are_deleted_and_replaced() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 1));
    fixture
        .store
        .seed_gameserver(gameserver("gs-done", "set-1", GameServerState::Shutdown));

    fixture.pass().await;

    let servers = fixture.store.gameservers();
    assert_eq!(servers.len(), 1);
    let replacement = &servers[0];
    assert_ne!(replacement.name(), "gs-done");
    assert_eq!(replacement.state(), Some(GameServerState::PortAllocation));
}

#[tokio::test]
async fn expired_reservations_revert_to_ready() {
    let fixture = fixture();
    fixture.sets.apply(gameserver_set("set-1", 2));

    let mut expired = gameserver_on("gs-expired", "set-1", "node-1", GameServerState::Reserved);
    expired.status.as_mut().unwrap().reserved_until =
        Some(Time(chrono::Utc::now() - chrono::Duration::seconds(30)));
    fixture.store.seed_gameserver(expired);

    let mut held = gameserver_on("gs-held", "set-1", "node-1", GameServerState::Reserved);
    held.status.as_mut().unwrap().reserved_until =
        Some(Time(chrono::Utc::now() + chrono::Duration::seconds(300)));
    fixture.store.seed_gameserver(held);

    fixture.pass().await;

    let reverted = fixture.store.gameserver("gs-expired").unwrap();
    assert_eq!(reverted.state(), Some(GameServerState::Ready));
    assert_eq!(reverted.status.as_ref().unwrap().reserved_until, None);

    let still_held = fixture.store.gameserver("gs-held").unwrap();
    assert_eq!(still_held.state(), Some(GameServerState::Reserved));
}

#[tokio::test]
async fn set_status_reflects_observed_counts() {
    let fixture = fixture();
    fixture.store.seed_set(gameserver_set("set-1", 3));
    fixture.sets.apply(fixture.store.set("set-1").unwrap());
    fixture
        .store
        .seed_gameserver(gameserver_on("gs-a", "set-1", "node-1", GameServerState::Ready));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-b",
        "set-1",
        "node-1",
        GameServerState::Allocated,
    ));
    fixture.store.seed_gameserver(gameserver_on(
        "gs-c",
        "set-1",
        "node-2",
        GameServerState::Reserved,
    ));

    fixture.pass().await;

    let status = fixture.store.set("set-1").unwrap().status.unwrap();
    assert_eq!(status.replicas, 3);
    assert_eq!(status.ready_replicas, 1);
    assert_eq!(status.reserved_replicas, 1);
    assert_eq!(status.allocated_replicas, 1);
}
