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

//! The `billet.dev/v1` resource types and the pure rules evaluated over them.

pub mod gameserver;
pub mod overflow;
pub mod set;

pub use self::{
    gameserver::{
        transition, GameServer, GameServerSpec, GameServerState, GameServerStatus, Health,
        InvalidTransition, SchedulingStrategy, TransitionActor, SET_LABEL,
    },
    overflow::AllocationOverflow,
    set::{GameServerSet, GameServerSetSpec, GameServerSetStatus, GameServerTemplateSpec},
};
