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

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    cache::AllocationCache,
    metrics,
    reconcile::SetCatalog,
    resources::{GameServer, GameServerState, TransitionActor},
    store::{Store, StoreError},
};

/// An ephemeral request to exclusively claim one game server out of a set.
/// Not persisted beyond its own lifetime.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    /// The set to allocate from.
    pub game_server_set: String,
    /// Labels applied to the server atomically with the claim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations applied to the server atomically with the claim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// No candidate servers available for the set: a definitive "try later".
    #[error("no allocatable game servers in set {0}")]
    Exhausted(String),
    /// Every attempted candidate was claimed by a concurrent requester
    /// within this attempt's budget. Deliberately indistinguishable from
    /// [`Self::Exhausted`] for callers: both mean back off and retry.
    #[error("all candidate game servers in set {0} were claimed concurrently")]
    ConflictExhausted(String),
    #[error(transparent)]
    Store(StoreError),
}

impl AllocationError {
    /// Whether the caller should treat this as "no capacity right now".
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_) | Self::ConflictExhausted(_))
    }

    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::Exhausted(_) => "exhausted",
            Self::ConflictExhausted(_) => "conflict_exhausted",
            Self::Store(_) => "store",
        }
    }
}

/// Consumes allocation requests, selecting a candidate from the cache and
/// committing the `Ready`/`Reserved` → `Allocated` transition against the
/// authoritative store with optimistic-concurrency retry.
///
/// Multiple coordinators may run against the same store: requesters racing on
/// a candidate are serialized by the store's version check, never by a lock.
pub struct Allocator {
    cache: Arc<AllocationCache>,
    sets: Arc<SetCatalog>,
    store: Arc<dyn Store>,
}

impl Allocator {
    pub fn new(cache: Arc<AllocationCache>, sets: Arc<SetCatalog>, store: Arc<dyn Store>) -> Self {
        Self { cache, sets, store }
    }

    /// Claims one server for the requester, or reports that the set is
    /// exhausted. At most one requester ever receives a given server: the
    /// candidate list is advisory and every claim is re-verified by the
    /// store's version check at commit time.
    pub async fn allocate(
        &self,
        request: AllocationRequest,
    ) -> Result<GameServer, AllocationError> {
        let set = request.game_server_set.clone();
        let strategy = self
            .sets
            .get(&set)
            .map(|s| s.spec.scheduling)
            .unwrap_or_default();

        let candidates = self.cache.candidates(&set, strategy);
        if candidates.is_empty() {
            metrics::allocations_total("exhausted").inc();
            return Err(AllocationError::Exhausted(set));
        }

        // One bounded pass over the candidate sequence: a lost race advances
        // to the next candidate rather than retrying the same one.
        let mut attempted = 0usize;
        for candidate in candidates {
            let mut gs = (*candidate).clone();
            if let Err(error) = gs.apply_transition(GameServerState::Allocated, TransitionActor::Allocator)
            {
                // The cached snapshot already diverged from an allocatable
                // state; skip it rather than force the transition.
                tracing::debug!(server = gs.name(), %error, "skipping stale candidate");
                continue;
            }

            // Allocation-time metadata rides in the same conditional write as
            // the state transition, so there is no window where a server is
            // `Allocated` but unlabeled.
            if !request.labels.is_empty() {
                gs.metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(request.labels.clone());
            }
            if !request.annotations.is_empty() {
                gs.metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .extend(request.annotations.clone());
            }

            attempted += 1;
            match self.store.update_gameserver(gs).await {
                Ok(allocated) => {
                    tracing::info!(
                        server = allocated.name(),
                        set = %set,
                        node = allocated.node_name().unwrap_or_default(),
                        "allocated game server"
                    );
                    metrics::allocations_total("success").inc();
                    return Ok(allocated);
                }
                Err(StoreError::Conflict) => {
                    metrics::allocation_conflicts_total().inc();
                    continue;
                }
                Err(StoreError::NotFound(_)) => {
                    // Deleted while we raced; indistinguishable from losing.
                    metrics::allocation_conflicts_total().inc();
                    continue;
                }
                Err(error) => {
                    metrics::allocations_total("error").inc();
                    return Err(AllocationError::Store(error));
                }
            }
        }

        if attempted == 0 {
            metrics::allocations_total("exhausted").inc();
            Err(AllocationError::Exhausted(set))
        } else {
            metrics::allocations_total("conflict_exhausted").inc();
            Err(AllocationError::ConflictExhausted(set))
        }
    }
}
