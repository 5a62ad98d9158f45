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

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::{
    api::core::v1::{Container, ContainerPort, EnvVar, HTTPGetAction, Pod, PodSpec, Probe},
    apimachinery::pkg::{
        apis::meta::v1::{Condition, ObjectMeta, OwnerReference},
        util::intstr::IntOrString,
    },
    chrono::Utc,
};
use kube::{
    api::{Api, PostParams},
    runtime::controller::Action,
    Resource, ResourceExt,
};

use super::{Context, Error};
use crate::{
    api::{GameServer, GameServerPhase, GameServerStatus, Time, OWNER_LABEL},
    poll::{PollError, ServerStatus},
};

/// Polling cadence. Requeueing on a fixed interval bounds the staleness of
/// the occupancy data that drives fleet scaling, independent of watch events.
const REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

const REACHABLE_CONDITION: &str = "Reachable";

/// Keeps a [`GameServer`] backed by exactly one workload pod and surfaces the
/// server's observed state in its status subresource.
pub async fn reconcile(gameserver: Arc<GameServer>, context: Arc<Context>) -> Result<Action, Error> {
    let name = gameserver.name_any();
    let namespace = gameserver
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let pods: Api<Pod> = Api::namespaced(context.client.clone(), &namespace);

    // The pod shares the instance's name; absence means it has not been
    // created yet (or was lost) and this pass only creates it. The next pass
    // observes it.
    let Some(pod) = pods.get_opt(&name).await? else {
        let owner = gameserver
            .controller_owner_ref(&())
            .ok_or(Error::MissingObjectKey("metadata.uid"))?;
        let pod = build_pod(&gameserver, owner);
        match pods.create(&PostParams::default(), &pod).await {
            Ok(_) => tracing::info!(instance = %name, "created workload pod"),
            // Lost a race against an earlier create the cache hadn't seen.
            Err(kube::Error::Api(response)) if response.code == 409 => {}
            Err(error) => return Err(error.into()),
        }
        return Ok(Action::requeue(REQUEUE_INTERVAL));
    };

    let phase = phase_from_pod(pod.status.as_ref().and_then(|status| status.phase.as_deref()));
    let host_ip = pod.status.as_ref().and_then(|status| status.host_ip.clone());

    let mut status = gameserver.status.clone().unwrap_or_default();
    let now = Time(Utc::now());

    match host_ip {
        Some(host_ip) if phase == GameServerPhase::Running => {
            let endpoint = format!(
                "http://{host_ip}:{}{}",
                gameserver.spec.port,
                gameserver.spec.poll_path()
            );
            match context.poller.poll(&endpoint).await {
                Ok(report) => {
                    let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
                    apply_poll_success(
                        &mut status,
                        &report,
                        endpoint,
                        node_name,
                        &now,
                        gameserver.metadata.generation,
                    );
                }
                Err(error) => {
                    crate::metrics::poll_failures_total().inc();
                    tracing::debug!(instance = %name, %error, "status poll failed");
                    apply_poll_failure(&mut status, &error, &now, gameserver.metadata.generation);
                }
            }
        }
        // Not running (or not scheduled yet): write the phase through
        // untouched, keeping the last known occupancy.
        _ => status.phase = phase,
    }

    if gameserver.status.as_ref() != Some(&status) {
        let api: Api<GameServer> = Api::namespaced(context.client.clone(), &namespace);
        let mut updated = (*gameserver).clone();
        updated.status = Some(status);
        match api
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await
        {
            Ok(_) => {}
            // Deleted mid-pass, or a concurrent status writer won; the next
            // dispatch observes the new state.
            Err(kube::Error::Api(response)) if response.code == 404 || response.code == 409 => {
                tracing::debug!(instance = %name, code = response.code, "status update dropped");
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Shape of the workload pod backing an instance: host networking so
/// `hostIP:port` reaches the server directly, the allocated port injected as
/// `GAME_PORT`, and a readiness probe against the server's status endpoint.
fn build_pod(gameserver: &GameServer, owner: OwnerReference) -> Pod {
    let name = gameserver.name_any();
    let mut env = gameserver.spec.env.clone();
    env.push(EnvVar {
        name: "GAME_PORT".into(),
        value: Some(gameserver.spec.port.to_string()),
        value_from: None,
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: gameserver.namespace(),
            labels: Some(BTreeMap::from([
                ("app".to_string(), name.clone()),
                (OWNER_LABEL.to_string(), name),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            host_network: Some(true),
            dns_policy: Some("ClusterFirstWithHostNet".into()),
            node_selector: gameserver.spec.node_selector.clone(),
            restart_policy: Some("Always".into()),
            containers: vec![Container {
                name: "server".into(),
                image: Some(gameserver.spec.image().to_string()),
                env: Some(env),
                ports: Some(vec![ContainerPort {
                    container_port: gameserver.spec.port,
                    ..Default::default()
                }]),
                resources: gameserver.spec.resources.clone(),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some(gameserver.spec.poll_path().to_string()),
                        port: IntOrString::Int(gameserver.spec.port),
                        ..Default::default()
                    }),
                    initial_delay_seconds: Some(2),
                    period_seconds: Some(5),
                    timeout_seconds: Some(2),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn phase_from_pod(pod_phase: Option<&str>) -> GameServerPhase {
    match pod_phase {
        Some("Running") => GameServerPhase::Running,
        Some("Failed") => GameServerPhase::Error,
        Some("Succeeded") => GameServerPhase::Terminating,
        _ => GameServerPhase::Pending,
    }
}

fn apply_poll_success(
    status: &mut GameServerStatus,
    report: &ServerStatus,
    endpoint: String,
    node_name: Option<String>,
    now: &Time,
    generation: Option<i64>,
) {
    status.endpoint = Some(endpoint);
    status.last_polled = Some(now.clone());
    status.players = report.players;
    status.max_players = report.max_players;
    status.node_name = node_name;
    status.phase = GameServerPhase::Running;

    // The idle timer starts at the first zero observation and survives
    // repeated zero polls, so scale-down measures from the earliest one.
    if report.players == 0 {
        if status.zero_since.is_none() {
            status.zero_since = Some(now.clone());
        }
    } else {
        status.zero_since = None;
    }

    set_condition(
        &mut status.conditions,
        reachable(true, "OK", "status polled".into(), now, generation),
    );
}

fn apply_poll_failure(
    status: &mut GameServerStatus,
    error: &PollError,
    now: &Time,
    generation: Option<i64>,
) {
    status.phase = GameServerPhase::Unreachable;
    status.last_polled = Some(now.clone());
    set_condition(
        &mut status.conditions,
        reachable(false, "ConnectionError", error.to_string(), now, generation),
    );
}

fn reachable(
    reachable: bool,
    reason: &str,
    message: String,
    now: &Time,
    generation: Option<i64>,
) -> Condition {
    Condition {
        type_: REACHABLE_CONDITION.into(),
        status: if reachable { "True" } else { "False" }.into(),
        reason: reason.into(),
        message,
        last_transition_time: now.clone(),
        observed_generation: generation,
    }
}

/// Replaces the condition with the same type, or appends it.
fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}
