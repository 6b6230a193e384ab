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

//! Shared testing helpers: an in-memory [`Store`] with real
//! optimistic-concurrency semantics, and resource builders.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    resources::{
        GameServer, GameServerSet, GameServerSetSpec, GameServerSpec, GameServerState,
        GameServerStatus, GameServerTemplateSpec, SET_LABEL,
    },
    store::{Event, EventStream, Store, StoreError},
};

pub fn gameserver(name: &str, set: &str, state: GameServerState) -> GameServer {
    let mut gs = GameServer::new(name, GameServerSpec::default());
    gs.metadata.namespace = Some("default".into());
    gs.metadata.resource_version = Some("1".into());
    gs.metadata.labels = Some([(SET_LABEL.to_owned(), set.to_owned())].into());
    gs.status = Some(GameServerStatus::new(state));
    gs
}

pub fn gameserver_on(name: &str, set: &str, node: &str, state: GameServerState) -> GameServer {
    let mut gs = gameserver(name, set, state);
    gs.status.as_mut().unwrap().node_name = Some(node.to_owned());
    gs
}

pub fn gameserver_set(name: &str, replicas: u32) -> GameServerSet {
    let mut set = GameServerSet::new(
        name,
        GameServerSetSpec {
            replicas,
            scheduling: <_>::default(),
            allocation_overflow: None,
            template: GameServerTemplateSpec::default(),
        },
    );
    set.metadata.namespace = Some("default".into());
    set.metadata.resource_version = Some("1".into());
    set
}

/// [`Store`] kept in process memory. Conditional updates are a real
/// compare-and-swap on `resourceVersion` under one lock, so concurrent
/// allocation tests exercise the same at-most-one guarantee the API server
/// provides. Watches deliver an initial `Restarted` full listing followed by
/// per-write events.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    version: AtomicU64,
    gs_events: broadcast::Sender<Event<GameServer>>,
    set_events: broadcast::Sender<Event<GameServerSet>>,
}

#[derive(Default)]
struct Inner {
    gameservers: BTreeMap<String, GameServer>,
    sets: BTreeMap<String, GameServerSet>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            version: AtomicU64::new(1),
            gs_events: broadcast::channel(256).0,
            set_events: broadcast::channel(64).0,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Inserts an object directly for test setup, bypassing the version check.
    pub fn seed_gameserver(&self, mut gs: GameServer) {
        gs.metadata.resource_version = Some(self.next_version());
        let name = gs.name().to_owned();
        self.inner.lock().gameservers.insert(name, gs.clone());
        self.gs_events.send(Event::Applied(gs)).ok();
    }

    pub fn seed_set(&self, mut set: GameServerSet) {
        set.metadata.resource_version = Some(self.next_version());
        let name = set.name().to_owned();
        self.inner.lock().sets.insert(name, set.clone());
        self.set_events.send(Event::Applied(set)).ok();
    }

    pub fn gameserver(&self, name: &str) -> Option<GameServer> {
        self.inner.lock().gameservers.get(name).cloned()
    }

    pub fn gameservers(&self) -> Vec<GameServer> {
        self.inner.lock().gameservers.values().cloned().collect()
    }

    pub fn set(&self, name: &str) -> Option<GameServerSet> {
        self.inner.lock().sets.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl Store for InMemoryStore {
    async fn list_gameservers(&self) -> Result<Vec<GameServer>, StoreError> {
        Ok(self.gameservers())
    }

    async fn list_sets(&self) -> Result<Vec<GameServerSet>, StoreError> {
        Ok(self.inner.lock().sets.values().cloned().collect())
    }

    fn watch_gameservers(&self) -> EventStream<GameServer> {
        let mut events = self.gs_events.subscribe();
        let initial = self.gameservers();
        Box::pin(async_stream::stream! {
            yield Ok(Event::Restarted(initial));
            loop {
                match events.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(StoreError::Unavailable(format!("feed lagged by {missed} events")));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn watch_sets(&self) -> EventStream<GameServerSet> {
        let mut events = self.set_events.subscribe();
        let initial: Vec<GameServerSet> = self.inner.lock().sets.values().cloned().collect();
        Box::pin(async_stream::stream! {
            yield Ok(Event::Restarted(initial));
            loop {
                match events.recv().await {
                    Ok(event) => yield Ok(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(StoreError::Unavailable(format!("feed lagged by {missed} events")));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn create_gameserver(&self, mut gs: GameServer) -> Result<GameServer, StoreError> {
        let name = gs.name().to_owned();
        let mut inner = self.inner.lock();
        if inner.gameservers.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        gs.metadata.resource_version = Some(self.next_version());
        inner.gameservers.insert(name, gs.clone());
        drop(inner);

        self.gs_events.send(Event::Applied(gs.clone())).ok();
        Ok(gs)
    }

    async fn delete_gameserver(&self, name: &str) -> Result<(), StoreError> {
        let removed = self.inner.lock().gameservers.remove(name);
        match removed {
            Some(gs) => {
                self.gs_events.send(Event::Deleted(gs)).ok();
                Ok(())
            }
            None => Err(StoreError::NotFound(name.to_owned())),
        }
    }

    async fn update_gameserver(&self, mut gs: GameServer) -> Result<GameServer, StoreError> {
        let name = gs.name().to_owned();
        let mut inner = self.inner.lock();
        let current = inner
            .gameservers
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        // The compare-and-swap: exactly one writer per observed version wins.
        if current.metadata.resource_version != gs.metadata.resource_version {
            return Err(StoreError::Conflict);
        }

        gs.metadata.resource_version = Some(self.next_version());
        inner.gameservers.insert(name, gs.clone());
        drop(inner);

        self.gs_events.send(Event::Applied(gs.clone())).ok();
        Ok(gs)
    }

    async fn update_set_status(&self, set: GameServerSet) -> Result<(), StoreError> {
        let name = set.name().to_owned();
        let mut inner = self.inner.lock();
        let current = inner
            .sets
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        current.status = set.status;
        current.metadata.resource_version = Some(self.next_version());
        let updated = current.clone();
        drop(inner);

        self.set_events.send(Event::Applied(updated)).ok();
        Ok(())
    }
}
