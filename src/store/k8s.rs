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

use futures::StreamExt;
use kube::{
    api::{DeleteParams, ListParams, PostParams},
    runtime::watcher,
    Api,
};

use super::{Event, EventStream, Store, StoreError};
use crate::resources::{GameServer, GameServerSet};

/// [`Store`] backed by the Kubernetes API server. The API server's
/// `resourceVersion` check on replace is the conditional-update primitive;
/// its revision tokens are decimal and per-object monotonic, which is what
/// the cache's ordering guard relies on.
#[derive(Clone)]
pub struct KubernetesStore {
    gameservers: Api<GameServer>,
    sets: Api<GameServerSet>,
}

impl KubernetesStore {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            gameservers: Api::namespaced(client.clone(), namespace),
            sets: Api::namespaced(client, namespace),
        }
    }

    pub async fn connect(namespace: &str) -> crate::Result<Self> {
        let client = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            kube::Client::try_default(),
        )
        .await??;

        Ok(Self::new(client, namespace))
    }

    fn watcher_config() -> watcher::Config {
        // Default timeout is 5 minutes, far too slow for us to react.
        let mut config = watcher::Config::default().timeout(15);
        config.page_size = None;
        config
    }
}

fn convert_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) if response.code == 409 => {
            if response.reason == "AlreadyExists" {
                StoreError::AlreadyExists(response.message)
            } else {
                StoreError::Conflict
            }
        }
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound(response.message),
        error => StoreError::Unavailable(error.to_string()),
    }
}

fn convert_event<T>(event: watcher::Event<T>) -> Event<T> {
    match event {
        watcher::Event::Applied(object) => Event::Applied(object),
        watcher::Event::Deleted(object) => Event::Deleted(object),
        watcher::Event::Restarted(objects) => Event::Restarted(objects),
    }
}

fn watch<T>(api: Api<T>, config: watcher::Config) -> EventStream<T>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + serde::de::DeserializeOwned + 'static,
{
    watcher(api, config)
        .map(|result| {
            result
                .map(convert_event)
                .map_err(|error| StoreError::Unavailable(error.to_string()))
        })
        .boxed()
}

#[async_trait::async_trait]
impl Store for KubernetesStore {
    async fn list_gameservers(&self) -> Result<Vec<GameServer>, StoreError> {
        self.gameservers
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(convert_error)
    }

    async fn list_sets(&self) -> Result<Vec<GameServerSet>, StoreError> {
        self.sets
            .list(&ListParams::default())
            .await
            .map(|list| list.items)
            .map_err(convert_error)
    }

    fn watch_gameservers(&self) -> EventStream<GameServer> {
        watch(self.gameservers.clone(), Self::watcher_config())
    }

    fn watch_sets(&self) -> EventStream<GameServerSet> {
        watch(self.sets.clone(), Self::watcher_config())
    }

    async fn create_gameserver(&self, gs: GameServer) -> Result<GameServer, StoreError> {
        self.gameservers
            .create(&PostParams::default(), &gs)
            .await
            .map_err(convert_error)
    }

    async fn delete_gameserver(&self, name: &str) -> Result<(), StoreError> {
        self.gameservers
            .delete(name, &DeleteParams::default())
            .await
            .map(drop)
            .map_err(convert_error)
    }

    async fn update_gameserver(&self, gs: GameServer) -> Result<GameServer, StoreError> {
        let name = gs
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::NotFound("game server without a name".into()))?;

        // `replace` carries `metadata.resourceVersion`; the API server
        // rejects the write with 409 when the version is stale.
        self.gameservers
            .replace(&name, &PostParams::default(), &gs)
            .await
            .map_err(convert_error)
    }

    async fn update_set_status(&self, set: GameServerSet) -> Result<(), StoreError> {
        let name = set
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::NotFound("game server set without a name".into()))?;
        let body = serde_json::to_vec(&set)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;

        self.sets
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map(drop)
            .map_err(convert_error)
    }
}
