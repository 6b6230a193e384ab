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

//! The seam to the authoritative store. Everything with mutation authority
//! over `resourceVersion`-guarded fields lives behind [`Store`]; no
//! in-process lock substitutes for the store's version check.

pub mod k8s;

pub use self::k8s::KubernetesStore;

use crate::resources::{GameServer, GameServerSet};

/// One change delivered by the store's feed. Per-object events arrive in the
/// store-assigned version order; `Restarted` carries a fresh full listing and
/// is the first event of every (re)opened watch, so feed continuity is never
/// assumed across an interruption.
#[derive(Clone, Debug)]
pub enum Event<T> {
    Applied(T),
    Deleted(T),
    Restarted(Vec<T>),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A conditional write lost the optimistic-concurrency race. Recovered
    /// locally by the caller, never surfaced as-is.
    #[error("write lost the optimistic concurrency race")]
    Conflict,
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type EventStream<T> = futures::stream::BoxStream<'static, Result<Event<T>, StoreError>>;

/// List/watch and conditional-write operations over the cluster's
/// authoritative store, scoped to one namespace.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    async fn list_gameservers(&self) -> Result<Vec<GameServer>, StoreError>;

    async fn list_sets(&self) -> Result<Vec<GameServerSet>, StoreError>;

    fn watch_gameservers(&self) -> EventStream<GameServer>;

    fn watch_sets(&self) -> EventStream<GameServerSet>;

    async fn create_gameserver(&self, gs: GameServer) -> Result<GameServer, StoreError>;

    async fn delete_gameserver(&self, name: &str) -> Result<(), StoreError>;

    /// Replaces the stored object if and only if the carried
    /// `metadata.resourceVersion` is still current, failing with
    /// [`StoreError::Conflict`] otherwise. The returned object carries the
    /// newly assigned version.
    async fn update_gameserver(&self, gs: GameServer) -> Result<GameServer, StoreError>;

    async fn update_set_status(&self, set: GameServerSet) -> Result<(), StoreError>;
}
