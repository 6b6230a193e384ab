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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the back-reference from a [`GameServer`] to the set that
/// created it. This is a relation for lookup only, never ownership.
pub const SET_LABEL: &str = "billet.dev/gameserverset";

/// Spec for a [`GameServer`] resource: one managed server instance with a
/// lifecycle state tracked in [`GameServerStatus`].
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "billet.dev",
    version = "v1",
    kind = "GameServer",
    namespaced,
    status = "GameServerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Scheduling strategy, inherited from the owning set. Defaults to `Packed`.
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Health checking parameters consumed by the external health collaborator.
    #[serde(default)]
    pub health: Health,
}

impl Default for GameServerSpec {
    fn default() -> Self {
        Self {
            scheduling: SchedulingStrategy::Packed,
            health: Health::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Whether health checking is disabled or not
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in
    #[serde(default = "default_period_seconds")]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i32,
}

fn default_period_seconds() -> i32 {
    5
}
fn default_failure_threshold() -> i32 {
    5
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            period_seconds: default_period_seconds(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// The status of a [`GameServer`].
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current lifecycle state.
    pub state: GameServerState,
    /// The node the server was scheduled onto. Set once, immutable thereafter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// When set and in the past, a `Reserved` server reverts to `Ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<Time>,
}

impl GameServerStatus {
    pub fn new(state: GameServerState) -> Self {
        Self {
            state,
            node_name: None,
            reserved_until: None,
        }
    }
}

/// The lifecycle states of a [`GameServer`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum GameServerState {
    /// The server is being created and an open port needs to be allocated.
    PortAllocation,
    /// The server has been placed onto a node.
    Scheduled,
    /// The server process has declared that it is ready.
    RequestReady,
    /// Ready to take player connections, eligible for allocation.
    Ready,
    /// Withheld from deletion, still eligible for allocation. Time-boxed,
    /// reverts to `Ready` on expiry.
    Reserved,
    /// Exclusively claimed by a requester.
    Allocated,
    /// The server has shutdown and is awaiting deletion by its owning set.
    Shutdown,
    /// Something has gone wrong with the server and it cannot be resolved.
    Error,
    /// The server has failed its health checks.
    Unhealthy,
}

impl GameServerState {
    /// Terminal states have no outgoing transitions; recovery is recreation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Shutdown | Self::Error | Self::Unhealthy)
    }

    /// States prior to `Ready` that count as pending capacity.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::PortAllocation | Self::Scheduled | Self::RequestReady)
    }

    /// Whether a server in this state may be handed out by the allocator.
    pub fn is_allocatable(self) -> bool {
        matches!(self, Self::Ready | Self::Reserved)
    }
}

impl std::fmt::Display for GameServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PortAllocation => "PortAllocation",
            Self::Scheduled => "Scheduled",
            Self::RequestReady => "RequestReady",
            Self::Ready => "Ready",
            Self::Reserved => "Reserved",
            Self::Allocated => "Allocated",
            Self::Shutdown => "Shutdown",
            Self::Error => "Error",
            Self::Unhealthy => "Unhealthy",
        };
        f.write_str(name)
    }
}

/// Which component is requesting a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionActor {
    /// The reconciler and the lifecycle controllers.
    Controller,
    /// The allocation coordinator. The only actor allowed to claim a server.
    Allocator,
    /// The external health/readiness signal.
    Health,
}

impl std::fmt::Display for TransitionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Controller => "controller",
            Self::Allocator => "allocator",
            Self::Health => "health",
        })
    }
}

/// A requested state change that the transition table rejects.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to} requested by {actor}")]
pub struct InvalidTransition {
    pub from: GameServerState,
    pub to: GameServerState,
    pub actor: TransitionActor,
}

/// The single authority over state changes. Every component mutates a
/// server's state through this function; illegal transitions are rejected,
/// never coerced.
pub fn transition(
    current: GameServerState,
    requested: GameServerState,
    actor: TransitionActor,
) -> Result<GameServerState, InvalidTransition> {
    use GameServerState::*;

    let rejected = InvalidTransition {
        from: current,
        to: requested,
        actor,
    };

    if current.is_terminal() {
        return Err(rejected);
    }

    // Failure states are reachable from any non-terminal state: `Unhealthy`
    // unconditionally on a health-check failure, `Error` on a scheduling or
    // health failure.
    match requested {
        Unhealthy => {
            return if actor == TransitionActor::Health {
                Ok(Unhealthy)
            } else {
                Err(rejected)
            };
        }
        Error => {
            return if matches!(actor, TransitionActor::Controller | TransitionActor::Health) {
                Ok(Error)
            } else {
                Err(rejected)
            };
        }
        Allocated => {
            return if actor == TransitionActor::Allocator && current.is_allocatable() {
                Ok(Allocated)
            } else {
                Err(rejected)
            };
        }
        _ => {}
    }

    if actor != TransitionActor::Controller {
        return Err(rejected);
    }

    match (current, requested) {
        (PortAllocation, Scheduled)
        | (Scheduled, RequestReady)
        | (RequestReady, Ready)
        | (Ready, Reserved)
        | (Reserved, Ready)
        | (Allocated, Shutdown) => Ok(requested),
        _ => Err(rejected),
    }
}

/// The strategy used when placing allocations across a cluster's nodes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Prioritise the nodes already carrying the most allocated servers, to
    /// bin pack sessions onto as few nodes as possible. Most useful for
    /// dynamically sized clusters.
    Packed,
    /// Spread allocations round-robin across nodes. Most useful for
    /// statically sized clusters.
    Distributed,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        Self::Packed
    }
}

impl GameServer {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().map(|status| status.state)
    }

    pub fn is_allocated(&self) -> bool {
        self.state() == Some(GameServerState::Allocated)
    }

    /// The name of the owning set, looked up through the back-reference label.
    pub fn set_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SET_LABEL))
            .map(String::as_str)
    }

    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.node_name.as_deref())
    }

    /// The store's optimistic-concurrency token, decoded for per-object
    /// ordering. A token that cannot be decoded is treated as newer than
    /// anything previously seen rather than silently dropped.
    pub fn version(&self) -> u64 {
        match self.metadata.resource_version.as_deref() {
            Some(version) => version.parse().unwrap_or(u64::MAX),
            None => 0,
        }
    }

    /// Whether this server's reservation deadline has passed.
    pub fn reservation_expired(&self, now: Time) -> bool {
        self.state() == Some(GameServerState::Reserved)
            && self
                .status
                .as_ref()
                .and_then(|status| status.reserved_until.as_ref())
                .is_some_and(|deadline| deadline.0 <= now.0)
    }

    /// Moves this server through the transition table, rejecting anything the
    /// table does not permit. A server with no status yet is still in
    /// `PortAllocation`.
    pub fn apply_transition(
        &mut self,
        requested: GameServerState,
        actor: TransitionActor,
    ) -> Result<(), InvalidTransition> {
        let current = self.state().unwrap_or(GameServerState::PortAllocation);
        let new = transition(current, requested, actor)?;
        match self.status.as_mut() {
            Some(status) => {
                status.state = new;
                if new != GameServerState::Reserved {
                    status.reserved_until = None;
                }
            }
            None => self.status = Some(GameServerStatus::new(new)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GameServerState::*;
    use TransitionActor::*;

    #[test]
    fn lifecycle_chain() {
        for (from, to) in [
            (PortAllocation, Scheduled),
            (Scheduled, RequestReady),
            (RequestReady, Ready),
            (Ready, Reserved),
            (Reserved, Ready),
            (Allocated, Shutdown),
        ] {
            assert_eq!(transition(from, to, Controller), Ok(to));
        }
    }

    #[test]
    fn allocation_is_allocator_only() {
        assert_eq!(transition(Ready, Allocated, Allocator), Ok(Allocated));
        assert_eq!(transition(Reserved, Allocated, Allocator), Ok(Allocated));

        for actor in [Controller, Health] {
            assert!(transition(Ready, Allocated, actor).is_err());
        }
        for from in [PortAllocation, Scheduled, RequestReady] {
            assert!(transition(from, Allocated, Allocator).is_err());
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for from in [Shutdown, Error, Unhealthy] {
            for to in [
                PortAllocation,
                Scheduled,
                RequestReady,
                Ready,
                Reserved,
                Allocated,
                Shutdown,
                Error,
                Unhealthy,
            ] {
                for actor in [Controller, Allocator, Health] {
                    assert!(
                        transition(from, to, actor).is_err(),
                        "{from} -> {to} by {actor} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn unhealthy_from_any_non_terminal() {
        for from in [
            PortAllocation,
            Scheduled,
            RequestReady,
            Ready,
            Reserved,
            Allocated,
        ] {
            assert_eq!(transition(from, Unhealthy, Health), Ok(Unhealthy));
            assert!(transition(from, Unhealthy, Controller).is_err());
        }
    }

    #[test]
    fn illegal_transitions_are_rejected_not_coerced() {
        let error = transition(Shutdown, Ready, Controller).unwrap_err();
        assert_eq!(
            error,
            InvalidTransition {
                from: Shutdown,
                to: Ready,
                actor: Controller
            }
        );
        assert!(transition(Ready, PortAllocation, Controller).is_err());
        assert!(transition(PortAllocation, Ready, Controller).is_err());
    }

    #[test]
    fn apply_transition_clears_reservation_deadline() {
        let mut gs = GameServer::new("gs-1", GameServerSpec::default());
        gs.status = Some(GameServerStatus {
            state: Reserved,
            node_name: Some("node-a".into()),
            reserved_until: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono::Utc::now(),
            )),
        });

        gs.apply_transition(Ready, Controller).unwrap();
        let status = gs.status.as_ref().unwrap();
        assert_eq!(status.state, Ready);
        assert_eq!(status.reserved_until, None);
        assert_eq!(status.node_name.as_deref(), Some("node-a"));
    }
}
