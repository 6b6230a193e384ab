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

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::GameServer;

/// Labels and/or annotations to apply to `Allocated` game servers when the
/// desired replica count of the owning set drops below the number of servers
/// already allocated. Declarative data evaluated by pure functions; the
/// reconciler never deletes a live server to satisfy a scale-down.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AllocationOverflow {
    /// Labels to be applied to the `GameServer`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations to be applied to the `GameServer`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl AllocationOverflow {
    /// Returns the number of `Allocated` servers whose labels and annotations
    /// already satisfy this policy, and the allocated servers left over. A
    /// server matches iff every key here is present with an equal value;
    /// extra unrelated keys on the server are irrelevant. Servers that are
    /// not `Allocated` are ignored entirely.
    pub fn count_matches<'list>(
        &self,
        list: &'list [GameServer],
    ) -> (u32, Vec<&'list GameServer>) {
        let mut count = 0;
        let mut rest = Vec::new();

        for gs in list.iter().filter(|gs| gs.is_allocated()) {
            if subset(&self.labels, gs.metadata.labels.as_ref())
                && subset(&self.annotations, gs.metadata.annotations.as_ref())
            {
                count += 1;
            } else {
                rest.push(gs);
            }
        }

        (count, rest)
    }

    /// Merges this policy's labels and annotations into the server's
    /// metadata, creating the maps if absent and overwriting conflicting
    /// keys. Idempotent.
    pub fn apply_to(&self, gs: &mut GameServer) {
        if !self.labels.is_empty() {
            gs.metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if !self.annotations.is_empty() {
            gs.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .extend(self.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

fn subset(wanted: &BTreeMap<String, String>, have: Option<&BTreeMap<String, String>>) -> bool {
    wanted
        .iter()
        .all(|(key, value)| have.is_some_and(|map| map.get(key) == Some(value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{GameServerSpec, GameServerState, GameServerStatus};

    fn gameserver(name: &str, state: GameServerState, labels: &[(&str, &str)]) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.status = Some(GameServerStatus::new(state));
        if !labels.is_empty() {
            gs.metadata.labels = Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
        }
        gs
    }

    fn overflow(labels: &[(&str, &str)]) -> AllocationOverflow {
        AllocationOverflow {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn matches_exact_key_values_only() {
        let policy = overflow(&[("tier", "drain")]);
        let list = vec![
            gameserver("gs-match", GameServerState::Allocated, &[("tier", "drain")]),
            gameserver(
                "gs-superset",
                GameServerState::Allocated,
                &[("tier", "drain"), ("region", "eu")],
            ),
            gameserver("gs-wrong-value", GameServerState::Allocated, &[("tier", "live")]),
            gameserver("gs-missing", GameServerState::Allocated, &[]),
        ];

        let (count, rest) = policy.count_matches(&list);
        assert_eq!(count, 2);
        assert_eq!(
            rest.iter().map(|gs| gs.name()).collect::<Vec<_>>(),
            vec!["gs-wrong-value", "gs-missing"]
        );
    }

    #[test]
    fn non_allocated_servers_are_ignored() {
        let policy = overflow(&[("tier", "drain")]);
        let list = vec![
            gameserver("gs-ready", GameServerState::Ready, &[]),
            gameserver("gs-reserved", GameServerState::Reserved, &[("tier", "drain")]),
            gameserver("gs-shutdown", GameServerState::Shutdown, &[]),
        ];

        let (count, rest) = policy.count_matches(&list);
        assert_eq!(count, 0);
        assert!(rest.is_empty());
    }

    #[test]
    fn empty_policy_matches_every_allocated_server() {
        let policy = AllocationOverflow::default();
        let list = vec![
            gameserver("gs-1", GameServerState::Allocated, &[]),
            gameserver("gs-2", GameServerState::Allocated, &[("any", "thing")]),
        ];

        let (count, rest) = policy.count_matches(&list);
        assert_eq!(count, 2);
        assert!(rest.is_empty());
    }

    #[test]
    fn apply_is_idempotent_and_preserves_unrelated_keys() {
        let policy = AllocationOverflow {
            labels: [("tier".to_string(), "drain".to_string())].into(),
            annotations: [("note".to_string(), "scaling down".to_string())].into(),
        };
        let mut gs = gameserver(
            "gs-1",
            GameServerState::Allocated,
            &[("region", "eu"), ("tier", "live")],
        );

        policy.apply_to(&mut gs);
        let once = gs.metadata.clone();

        let labels = once.labels.as_ref().unwrap();
        assert_eq!(labels.get("tier").map(String::as_str), Some("drain"));
        assert_eq!(labels.get("region").map(String::as_str), Some("eu"));
        assert_eq!(
            once.annotations.as_ref().unwrap().get("note").map(String::as_str),
            Some("scaling down")
        );

        policy.apply_to(&mut gs);
        assert_eq!(gs.metadata.labels, once.labels);
        assert_eq!(gs.metadata.annotations, once.annotations);
    }

    #[test]
    fn apply_creates_missing_maps() {
        let policy = overflow(&[("tier", "drain")]);
        let mut gs = gameserver("gs-1", GameServerState::Allocated, &[]);
        assert!(gs.metadata.labels.is_none());

        policy.apply_to(&mut gs);
        assert_eq!(
            gs.metadata.labels.as_ref().unwrap().get("tier").map(String::as_str),
            Some("drain")
        );
        // No annotations in the policy, so none are created.
        assert!(gs.metadata.annotations.is_none());
    }
}
