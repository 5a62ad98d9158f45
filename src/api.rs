/*
 * Copyright 2024 Google LLC
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

use k8s_openapi::{
    api::core::v1::{EnvVar, ResourceRequirements},
    apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Label placed on every [`GameServer`] owned by a [`GSDeployment`], holding
/// the owning deployment's name.
pub const OWNER_LABEL: &str = "game.example.com/owner";

/// Annotation marking an instance as slated for removal by a rollout. Set
/// once, never cleared; the instance is deleted when its occupancy reaches
/// zero.
pub const DRAIN_ANNOTATION: &str = "game.example.com/draining";

pub const DEFAULT_IMAGE: &str = "kyon/gameserver:latest";
pub const DEFAULT_POLL_PATH: &str = "/status";

fn default_scale_up_threshold() -> i32 {
    80
}
fn default_scale_down_zero_seconds() -> i64 {
    60
}
fn default_drain_timeout_seconds() -> i64 {
    7200
}
fn default_max_surge() -> i32 {
    2
}

/// A single dedicated game-server instance. Created and deleted by the fleet
/// controller; its status is maintained by the instance controller.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "game.example.com",
    version = "v1alpha1",
    kind = "GameServer",
    namespaced,
    status = "GameServerStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Players","type":"integer","jsonPath":".status.players"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container image for the server process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Host port allocated by the owning deployment, unique within it.
    pub port: i32,
    /// Path of the HTTP status endpoint the operator polls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
}

impl GameServerSpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn poll_path(&self) -> &str {
        self.poll_path.as_deref().unwrap_or(DEFAULT_POLL_PATH)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default)]
    pub players: i32,
    #[serde(default)]
    pub max_players: i32,
    /// URL the status poller last reached the server at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_polled: Option<Time>,
    #[serde(default)]
    pub phase: GameServerPhase,
    /// Set when a successful poll first observes zero players, cleared when a
    /// poll observes any. Drives idle scale-down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_since: Option<Time>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GameServerPhase {
    #[default]
    Pending,
    Running,
    /// The pod runs but the status endpoint cannot be reached.
    Unreachable,
    Error,
    Terminating,
}

/// Inclusive host-port range a deployment allocates instance ports from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PortRange {
    pub start: i32,
    pub end: i32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Only `NoDisruption` is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    /// Ceiling on how long a draining instance is waited for. Declared for
    /// forward compatibility; rollout currently waits for occupancy to reach
    /// zero however long that takes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_seconds: Option<i64>,
    /// Instances that may be added above `minReplicas` during rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<i32>,
    /// Declared for forward compatibility; rollout only surges and never
    /// removes ready instances pre-emptively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Inline runtime parameters pushed into every instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_players: Option<i32>,
}

/// Declared intent for a fleet of [`GameServer`]s.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "game.example.com",
    version = "v1alpha1",
    kind = "GSDeployment",
    namespaced,
    status = "GSDeploymentStatus",
    shortname = "gsd",
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GSDeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_path: Option<String>,
    pub min_replicas: i32,
    pub max_replicas: i32,
    /// Occupancy percentage at which another instance is added.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_threshold_percent: Option<i32>,
    /// How long an instance must sit at zero players before idle scale-down
    /// may delete it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_zero_seconds: Option<i64>,
    pub port_range: PortRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl GSDeploymentSpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn poll_path(&self) -> &str {
        self.poll_path.as_deref().unwrap_or(DEFAULT_POLL_PATH)
    }

    pub fn scale_up_threshold_percent(&self) -> i32 {
        self.scale_up_threshold_percent
            .unwrap_or_else(default_scale_up_threshold)
    }

    pub fn scale_down_zero_seconds(&self) -> i64 {
        self.scale_down_zero_seconds
            .unwrap_or_else(default_scale_down_zero_seconds)
    }

    pub fn max_surge(&self) -> i32 {
        self.update_strategy
            .max_surge
            .unwrap_or_else(default_max_surge)
    }

    pub fn drain_timeout_seconds(&self) -> i64 {
        self.update_strategy
            .drain_timeout_seconds
            .unwrap_or_else(default_drain_timeout_seconds)
    }

    /// `MAX_PLAYERS` value every current instance must carry, if the
    /// deployment pins one.
    pub fn desired_max_players(&self) -> Option<String> {
        self.parameters
            .as_ref()
            .and_then(|params| params.max_players)
            .map(|n| n.to_string())
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GSDeploymentStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    /// Ports currently held by children, ascending.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allocated_ports: Vec<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Labels selecting the children of the named deployment.
pub fn owner_labels(owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())])
}
