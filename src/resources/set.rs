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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{AllocationOverflow, GameServerSpec, SchedulingStrategy};

/// Spec for a `GameServerSet`: a group of game servers sharing a template and
/// a desired replica count. The set is the sole authority that creates and
/// deletes its non-allocated members; it never deletes an `Allocated` member.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "billet.dev",
    version = "v1",
    kind = "GameServerSet",
    namespaced,
    status = "GameServerSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// The desired number of replicas, counting `Ready`, `Reserved`, pending
    /// and `Allocated` servers.
    pub replicas: u32,
    /// Scheduling strategy for allocations out of this set. Defaults to `Packed`.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Labels and/or annotations to apply to allocated servers when
    /// `replicas` drops below the number currently allocated. Without this,
    /// such a scale-down is reported as unresolved and nothing is evicted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_overflow: Option<AllocationOverflow>,
    /// Template for the game servers this set creates.
    #[serde(default)]
    pub template: GameServerTemplateSpec,
}

/// Template for a [`super::GameServer`] resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: GameServerSpec,
}

/// Aggregate counters for a set, rewritten by the reconciler every pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// Total non-terminal replicas currently attached to the set.
    pub replicas: u32,
    pub ready_replicas: u32,
    pub reserved_replicas: u32,
    pub allocated_replicas: u32,
}

impl GameServerSet {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
