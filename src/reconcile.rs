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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::{
    cache::AllocationCache,
    metrics,
    resources::{
        GameServer, GameServerSet, GameServerSetStatus, GameServerState, GameServerStatus,
        TransitionActor, SET_LABEL,
    },
    store::{Event, Store, StoreError},
};

/// The sets currently known to this process, maintained from the store's set
/// watch and shared with the allocator for strategy lookup.
#[derive(Debug, Default)]
pub struct SetCatalog(DashMap<String, Arc<GameServerSet>>);

impl SetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, set: GameServerSet) {
        if let Some(name) = set.metadata.name.clone() {
            self.0.insert(name, Arc::new(set));
        }
    }

    pub fn delete(&self, name: &str) {
        self.0.remove(name);
    }

    pub fn resync(&self, list: Vec<GameServerSet>) {
        self.0.clear();
        for set in list {
            self.apply(set);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<GameServerSet>> {
        self.0.get(name).map(|entry| entry.value().clone())
    }

    /// All known sets, name-ordered so a pass walks them deterministically.
    pub fn snapshot(&self) -> Vec<Arc<GameServerSet>> {
        let mut sets: Vec<_> = self.0.iter().map(|entry| entry.value().clone()).collect();
        sets.sort_by(|a, b| a.name().cmp(b.name()));
        sets
    }
}

/// The control loop converging each set's observed servers onto its desired
/// replica count. Creates and deletes non-allocated servers only; a
/// scale-down below the live allocated count is resolved by overflow marking,
/// never by eviction.
pub struct FleetReconciler {
    store: Arc<dyn Store>,
    cache: Arc<AllocationCache>,
    sets: Arc<SetCatalog>,
    interval: Duration,
}

impl FleetReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<AllocationCache>,
        sets: Arc<SetCatalog>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            sets,
            interval,
        }
    }

    /// Runs passes until shutdown, re-triggered periodically and on every
    /// relevant change-feed event. A failed or partial pass is corrected by
    /// the next one rather than retried in place.
    pub async fn run(&self, mut shutdown: crate::signal::ShutdownRx) -> crate::Result<()> {
        let mut sets = self.store.watch_sets();
        let mut changes = self.cache.changes();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => {}
                changed = changes.changed() => if changed.is_err() {
                    return Ok(());
                },
                event = sets.next() => match event {
                    Some(Ok(Event::Applied(set))) => self.sets.apply(set),
                    Some(Ok(Event::Deleted(set))) => self.sets.delete(set.name()),
                    Some(Ok(Event::Restarted(list))) => self.sets.resync(list),
                    Some(Err(error)) => return Err(error.into()),
                    None => return Err(eyre::eyre!("game server set watch stream terminated")),
                },
            }

            self.reconcile_once().await;
        }
    }

    /// One full pass over every known set.
    pub async fn reconcile_once(&self) {
        if !self.cache.is_synced() {
            tracing::debug!("allocation cache not yet synced, skipping pass");
            return;
        }

        let timer = metrics::reconcile_duration_seconds().start_timer();
        let listing = match self.store.list_gameservers().await {
            Ok(listing) => listing,
            Err(error) => {
                tracing::warn!(%error, "listing game servers failed, deferring to next pass");
                return;
            }
        };

        let mut by_set: BTreeMap<String, Vec<GameServer>> = BTreeMap::new();
        for gs in listing {
            if let Some(set) = gs.set_name() {
                by_set.entry(set.to_owned()).or_default().push(gs);
            }
        }

        for set in self.sets.snapshot() {
            let servers = by_set.remove(set.name()).unwrap_or_default();
            if let Err(error) = self.reconcile_set(&set, &servers).await {
                tracing::warn!(set = set.name(), %error, "reconciliation failed, retrying next pass");
            }
        }

        timer.observe_duration();
    }

    async fn reconcile_set(
        &self,
        set: &GameServerSet,
        servers: &[GameServer],
    ) -> crate::Result<()> {
        let name = set.name();
        let desired = set.spec.replicas;

        self.revert_expired_reservations(servers).await?;
        self.delete_terminal(name, servers).await?;

        let counts = self.cache.counts(name);
        for (bucket, value) in [
            ("pending", counts.pending),
            ("ready", counts.ready),
            ("reserved", counts.reserved),
            ("allocated", counts.allocated),
        ] {
            metrics::gameservers(name, bucket).set(value as i64);
        }

        if counts.total() < desired {
            self.scale_up(set, desired - counts.total()).await?;
        } else if counts.allocated > desired {
            // The target cannot be met by deleting: live sessions are never
            // evicted. Mark the excess instead and run above target until
            // the sessions end naturally.
            self.resolve_overflow(set, servers).await?;
        } else if counts.total() > desired {
            self.scale_down(name, servers, counts.total() - desired)
                .await?;
        }

        self.refresh_status(set, counts).await
    }

    async fn revert_expired_reservations(&self, servers: &[GameServer]) -> crate::Result<()> {
        let now = Time(chrono::Utc::now());
        for gs in servers
            .iter()
            .filter(|gs| gs.reservation_expired(now.clone()))
        {
            let mut updated = gs.clone();
            updated.apply_transition(GameServerState::Ready, TransitionActor::Controller)?;

            match self.store.update_gameserver(updated).await {
                Ok(_) => {
                    tracing::debug!(server = gs.name(), "reservation expired, back to Ready");
                }
                Err(StoreError::Conflict | StoreError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn delete_terminal(&self, set: &str, servers: &[GameServer]) -> crate::Result<()> {
        for gs in servers
            .iter()
            .filter(|gs| gs.state().is_some_and(GameServerState::is_terminal))
        {
            match self.store.delete_gameserver(gs.name()).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    tracing::debug!(
                        set,
                        server = gs.name(),
                        state = %gs.state().unwrap_or(GameServerState::Shutdown),
                        "removed finished game server"
                    );
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn scale_up(&self, set: &GameServerSet, missing: u32) -> crate::Result<()> {
        tracing::info!(set = set.name(), missing, "creating game servers");
        for _ in 0..missing {
            let gs = new_gameserver(set);
            match self.store.create_gameserver(gs).await {
                Ok(_) => {}
                // A name collision just means one fewer created this pass.
                Err(StoreError::AlreadyExists(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn scale_down(
        &self,
        set: &str,
        servers: &[GameServer],
        excess: u32,
    ) -> crate::Result<()> {
        // Only non-allocated, non-reserved servers are deletable; least
        // invested first, then name order.
        let mut deletable: Vec<&GameServer> = servers
            .iter()
            .filter(|gs| {
                gs.state()
                    .is_some_and(|state| state.is_pending() || state == GameServerState::Ready)
            })
            .collect();
        deletable.sort_by_key(|gs| (deletion_rank(gs), gs.name().to_owned()));

        for gs in deletable.into_iter().take(excess as usize) {
            match self.store.delete_gameserver(gs.name()).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {
                    tracing::info!(set, server = gs.name(), "scaled down game server");
                }
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn resolve_overflow(
        &self,
        set: &GameServerSet,
        servers: &[GameServer],
    ) -> crate::Result<()> {
        let name = set.name();
        let Some(policy) = &set.spec.allocation_overflow else {
            tracing::warn!(
                set = name,
                desired = set.spec.replicas,
                "allocated servers exceed desired replicas and no overflow policy is configured"
            );
            metrics::overflow_unresolved_total(name).inc();
            return Ok(());
        };

        let (matched, rest) = policy.count_matches(servers);
        if rest.is_empty() {
            return Ok(());
        }
        tracing::info!(set = name, matched, marking = rest.len(), "applying overflow policy");

        let mut marked = 0;
        for gs in rest {
            let mut updated = gs.clone();
            policy.apply_to(&mut updated);
            match self.store.update_gameserver(updated).await {
                Ok(_) => marked += 1,
                Err(StoreError::Conflict | StoreError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        metrics::overflow_marked_total().inc_by(marked);
        Ok(())
    }

    async fn refresh_status(
        &self,
        set: &GameServerSet,
        counts: crate::cache::SetCounts,
    ) -> crate::Result<()> {
        let status = GameServerSetStatus {
            replicas: counts.total(),
            ready_replicas: counts.ready,
            reserved_replicas: counts.reserved,
            allocated_replicas: counts.allocated,
        };
        if set.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = set.clone();
        updated.status = Some(status);
        match self.store.update_set_status(updated).await {
            Ok(()) | Err(StoreError::Conflict | StoreError::NotFound(_)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn deletion_rank(gs: &GameServer) -> u8 {
    match gs.state() {
        Some(GameServerState::PortAllocation) | None => 0,
        Some(GameServerState::Scheduled) => 1,
        Some(GameServerState::RequestReady) => 2,
        _ => 3,
    }
}

fn new_gameserver(set: &GameServerSet) -> GameServer {
    let mut spec = set.spec.template.spec.clone();
    spec.scheduling = set.spec.scheduling;

    let mut gs = GameServer::new(&generate_name(set.name()), spec);
    let template_meta = set.spec.template.metadata.clone().unwrap_or_default();
    let mut labels = template_meta.labels.unwrap_or_default();
    labels.insert(SET_LABEL.to_owned(), set.name().to_owned());
    gs.metadata.labels = Some(labels);
    gs.metadata.annotations = template_meta.annotations;
    gs.metadata.namespace = set.metadata.namespace.clone();
    gs.status = Some(GameServerStatus::new(GameServerState::PortAllocation));
    gs
}

fn generate_name(set: &str) -> String {
    use rand::Rng;

    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{set}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn generated_names_stay_within_the_label_value_limit() {
        // Validation of set names happens upstream; the generated suffix must
        // not push a maximum-length set name over the 63 character limit.
        let set = "a".repeat(57);
        assert_eq!(generate_name(&set).len(), 63);
    }

    #[test]
    fn new_gameserver_carries_the_set_reference_and_strategy() {
        let mut set = test_utils::gameserver_set("set-1", 3);
        set.spec.scheduling = crate::resources::SchedulingStrategy::Distributed;
        set.spec.template.metadata = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            labels: Some([("game".to_owned(), "arena".to_owned())].into()),
            ..Default::default()
        });

        let gs = new_gameserver(&set);
        assert_eq!(gs.set_name(), Some("set-1"));
        assert_eq!(
            gs.metadata.labels.as_ref().unwrap().get("game").map(String::as_str),
            Some("arena")
        );
        assert_eq!(
            gs.spec.scheduling,
            crate::resources::SchedulingStrategy::Distributed
        );
        assert_eq!(gs.state(), Some(GameServerState::PortAllocation));
        assert!(gs.name().starts_with("set-1-"));
    }
}
