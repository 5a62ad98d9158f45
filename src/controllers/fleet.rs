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

use std::{collections::BTreeSet, sync::Arc};

use k8s_openapi::{
    api::core::v1::EnvVar,
    chrono::{DateTime, Utc},
};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::controller::Action,
    Resource, ResourceExt,
};

use super::{Context, Error};
use crate::{
    api::{
        owner_labels, GSDeployment, GSDeploymentSpec, GameServer, GameServerPhase, GameServerSpec,
        DRAIN_ANNOTATION, OWNER_LABEL,
    },
    ports,
};

const MAX_PLAYERS_ENV: &str = "MAX_PLAYERS";

/// Converges a deployment's child set: drains outdated instances, surges
/// replacements, enforces the replica floor, adds capacity under load, and
/// retires idle instances. An instance with players on it is never deleted.
pub async fn reconcile(deployment: Arc<GSDeployment>, context: Arc<Context>) -> Result<Action, Error> {
    let name = deployment.name_any();
    let namespace = deployment
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let api: Api<GameServer> = Api::namespaced(context.client.clone(), &namespace);

    let spec = &deployment.spec;
    let desired_max_players = spec.desired_max_players();

    let params = ListParams::default().labels(&format!("{OWNER_LABEL}={name}"));
    let mut children = api.list(&params).await?.items;

    let mut used: BTreeSet<i32> = children.iter().map(|child| child.spec.port).collect();
    let ready = children
        .iter()
        .filter(|child| {
            child
                .status
                .as_ref()
                .is_some_and(|status| status.phase == GameServerPhase::Running)
        })
        .count() as i32;

    // Instances whose image or MAX_PLAYERS no longer match the declared spec
    // are marked draining. The mark is one-way and best-effort; a failed
    // write is retried on the next pass.
    let mut outdated = 0usize;
    for child in &children {
        if matches_desired(child, spec, desired_max_players.as_deref()) {
            continue;
        }
        outdated += 1;
        if is_draining(child) {
            continue;
        }
        let patch = serde_json::json!({
            "metadata": { "annotations": { DRAIN_ANNOTATION: "true" } }
        });
        if let Err(error) = api
            .patch(&child.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            tracing::warn!(instance = %child.name_any(), %error, "failed to mark instance as draining");
        }
    }

    // Rollout surge: introduce replacements on the current spec before the
    // drained ones retire, bounded by maxSurge above the floor and by the
    // fleet ceiling.
    let mut total = children.len() as i32;
    let surge_limit = spec.min_replicas + spec.max_surge();
    while outdated > 0 && total < surge_limit && total < spec.max_replicas {
        let Some(port) = ports::allocate(&used, &spec.port_range) else {
            tracing::warn!(deployment = %name, "port range exhausted during rollout surge");
            break;
        };
        let child = build_child(&deployment, port, desired_max_players.as_deref())?;
        api.create(&PostParams::default(), &child).await?;
        crate::metrics::instances_created_total().inc();
        tracing::info!(deployment = %name, port, "created surge instance");
        used.insert(port);
        total += 1;
        children.push(child);
    }

    // Replica floor.
    while total < spec.min_replicas {
        let Some(port) = ports::allocate(&used, &spec.port_range) else {
            tracing::warn!(deployment = %name, "port range exhausted below replica floor");
            break;
        };
        let child = build_child(&deployment, port, desired_max_players.as_deref())?;
        api.create(&PostParams::default(), &child).await?;
        crate::metrics::instances_created_total().inc();
        tracing::info!(deployment = %name, port, "created instance to meet replica floor");
        used.insert(port);
        total += 1;
    }

    // Re-list so the scaling decisions below see the instances just created.
    let mut children = api.list(&params).await?.items;
    used.extend(children.iter().map(|child| child.spec.port));

    // Scale up by one instance per pass while any server sits at or over the
    // occupancy threshold; sustained pressure ramps across passes.
    if over_threshold(&children, spec.scale_up_threshold_percent())
        && (children.len() as i32) < spec.max_replicas
    {
        match ports::allocate(&used, &spec.port_range) {
            Some(port) => {
                let child = build_child(&deployment, port, desired_max_players.as_deref())?;
                match api.create(&PostParams::default(), &child).await {
                    Ok(_) => {
                        crate::metrics::instances_created_total().inc();
                        tracing::info!(deployment = %name, port, "scaled up under player load");
                        used.insert(port);
                        children.push(child);
                    }
                    Err(error) => {
                        tracing::warn!(deployment = %name, %error, "scale-up create failed");
                    }
                }
            }
            None => tracing::warn!(deployment = %name, "port range exhausted, cannot scale up"),
        }
    }

    // Scale down: zero-player instances only, oldest first, draining ones
    // immediately and the rest after the idle grace period, re-checking the
    // floor after every deletion.
    if children.len() as i32 > spec.min_replicas {
        let now = Utc::now();
        for candidate in scale_down_candidates(&children, spec.scale_down_zero_seconds(), &now) {
            if children.len() as i32 <= spec.min_replicas {
                break;
            }
            match api.delete(&candidate, &DeleteParams::default()).await {
                Ok(_) => {
                    crate::metrics::instances_deleted_total().inc();
                    tracing::info!(deployment = %name, instance = %candidate, "deleted idle instance");
                }
                Err(error) => {
                    tracing::warn!(deployment = %name, instance = %candidate, %error, "failed to delete idle instance");
                }
            }
            // Drop the candidate from the working set either way so a failed
            // delete cannot cause over-deletion within this pass.
            children.retain(|child| child.name_any() != candidate);
        }
    }

    let mut allocated: Vec<i32> = children.iter().map(|child| child.spec.port).collect();
    allocated.sort_unstable();

    let mut status = deployment.status.clone().unwrap_or_default();
    status.replicas = children.len() as i32;
    status.ready_replicas = ready;
    status.allocated_ports = allocated;

    if deployment.status.as_ref() != Some(&status) {
        let deployments: Api<GSDeployment> = Api::namespaced(context.client.clone(), &namespace);
        let mut updated = (*deployment).clone();
        updated.status = Some(status);
        match deployments
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(&updated)?)
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 || response.code == 409 => {
                tracing::debug!(deployment = %name, code = response.code, "status update dropped");
            }
            Err(error) => return Err(error.into()),
        }
    }

    // Event-driven: child status changes re-dispatch through ownership.
    Ok(Action::await_change())
}

/// An instance is current iff it runs the declared image and, when the
/// deployment pins `MAX_PLAYERS`, carries that exact value.
fn matches_desired(
    child: &GameServer,
    spec: &GSDeploymentSpec,
    desired_max_players: Option<&str>,
) -> bool {
    let matches_image = child.spec.image() == spec.image();
    let matches_players = match desired_max_players {
        Some(value) => env_has(&child.spec.env, MAX_PLAYERS_ENV, value),
        None => true,
    };
    matches_image && matches_players
}

fn env_has(env: &[EnvVar], name: &str, value: &str) -> bool {
    env.iter()
        .any(|var| var.name == name && var.value.as_deref() == Some(value))
}

/// Returns `env` with `MAX_PLAYERS` overwritten, or appended when absent.
/// Without a pinned value the declared env passes through untouched.
fn ensure_max_players(env: &[EnvVar], desired: Option<&str>) -> Vec<EnvVar> {
    let Some(desired) = desired else {
        return env.to_vec();
    };

    let pinned = EnvVar {
        name: MAX_PLAYERS_ENV.into(),
        value: Some(desired.to_string()),
        value_from: None,
    };
    let mut merged: Vec<EnvVar> = env
        .iter()
        .map(|var| {
            if var.name == MAX_PLAYERS_ENV {
                pinned.clone()
            } else {
                var.clone()
            }
        })
        .collect();
    if !env_has(&merged, MAX_PLAYERS_ENV, desired) {
        merged.push(pinned);
    }
    merged
}

/// Instance template on the deployment's current spec. Named after its port,
/// which is unique within the deployment.
fn build_child(
    deployment: &GSDeployment,
    port: i32,
    desired_max_players: Option<&str>,
) -> Result<GameServer, Error> {
    let owner = deployment
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let name = format!("{}-{port}", deployment.name_any());

    let mut child = GameServer::new(
        &name,
        GameServerSpec {
            image: Some(deployment.spec.image().to_string()),
            port,
            poll_path: Some(deployment.spec.poll_path().to_string()),
            env: ensure_max_players(&deployment.spec.env, desired_max_players),
            resources: deployment.spec.resources.clone(),
            node_selector: deployment.spec.node_selector.clone(),
        },
    );
    child.metadata.namespace = deployment.namespace();
    child.metadata.labels = Some(owner_labels(&deployment.name_any()));
    child.metadata.owner_references = Some(vec![owner]);
    Ok(child)
}

fn is_draining(child: &GameServer) -> bool {
    child.annotations().get(DRAIN_ANNOTATION).map(String::as_str) == Some("true")
}

fn over_threshold(children: &[GameServer], threshold_percent: i32) -> bool {
    children.iter().any(|child| {
        child.status.as_ref().is_some_and(|status| {
            status.max_players > 0
                && status.players * 100 / status.max_players >= threshold_percent
        })
    })
}

/// Names of instances eligible for deletion, oldest first: zero players and
/// either draining (immediate) or idle past the grace period. Occupied
/// instances are never eligible, draining or not.
fn scale_down_candidates(
    children: &[GameServer],
    zero_seconds: i64,
    now: &DateTime<Utc>,
) -> Vec<String> {
    let mut idle: Vec<&GameServer> = children
        .iter()
        .filter(|child| {
            let players = child
                .status
                .as_ref()
                .map(|status| status.players)
                .unwrap_or_default();
            if players != 0 {
                return false;
            }
            if is_draining(child) {
                return true;
            }
            child
                .status
                .as_ref()
                .and_then(|status| status.zero_since.as_ref())
                .is_some_and(|since| now.signed_duration_since(since.0).num_seconds() >= zero_seconds)
        })
        .collect();

    idle.sort_by_key(|child| child.creation_timestamp().map(|time| time.0));
    idle.into_iter().map(|child| child.name_any()).collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::chrono::Duration as ChronoDuration;

    use super::*;
    use crate::api::{GameServerStatus, Parameters, PortRange, Time};

    fn deployment(max_players: Option<i32>) -> GSDeployment {
        let mut deployment = GSDeployment::new(
            "arena",
            GSDeploymentSpec {
                image: Some("kyon/gameserver:v2".into()),
                poll_path: None,
                min_replicas: 2,
                max_replicas: 5,
                scale_up_threshold_percent: None,
                scale_down_zero_seconds: None,
                port_range: PortRange {
                    start: 30000,
                    end: 30010,
                },
                node_selector: None,
                resources: None,
                env: vec![],
                update_strategy: Default::default(),
                parameters: max_players.map(|n| Parameters {
                    max_players: Some(n),
                }),
            },
        );
        deployment.metadata.namespace = Some("default".into());
        deployment.metadata.uid = Some("7b2d".into());
        deployment
    }

    struct ChildSpec<'a> {
        name: &'a str,
        image: &'a str,
        players: i32,
        zero_for: Option<i64>,
        draining: bool,
        age_seconds: i64,
    }

    fn child(opts: ChildSpec<'_>) -> GameServer {
        let now = Utc::now();
        let mut child = GameServer::new(
            opts.name,
            GameServerSpec {
                image: Some(opts.image.into()),
                port: 30000,
                poll_path: None,
                env: vec![],
                resources: None,
                node_selector: None,
            },
        );
        child.metadata.creation_timestamp =
            Some(Time(now - ChronoDuration::seconds(opts.age_seconds)));
        if opts.draining {
            child
                .annotations_mut()
                .insert(DRAIN_ANNOTATION.into(), "true".into());
        }
        child.status = Some(GameServerStatus {
            players: opts.players,
            max_players: 100,
            zero_since: opts
                .zero_for
                .map(|seconds| Time(now - ChronoDuration::seconds(seconds))),
            ..Default::default()
        });
        child
    }

    #[test]
    fn classification_tracks_image_drift() {
        let deployment = deployment(None);
        let current = child(ChildSpec {
            name: "arena-30000",
            image: "kyon/gameserver:v2",
            players: 0,
            zero_for: None,
            draining: false,
            age_seconds: 0,
        });
        let outdated = child(ChildSpec {
            name: "arena-30001",
            image: "kyon/gameserver:v1",
            players: 0,
            zero_for: None,
            draining: false,
            age_seconds: 0,
        });

        assert!(matches_desired(&current, &deployment.spec, None));
        assert!(!matches_desired(&outdated, &deployment.spec, None));
    }

    #[test]
    fn classification_tracks_max_players_drift() {
        let deployment = deployment(Some(64));
        let desired = deployment.spec.desired_max_players();

        let mut stale = child(ChildSpec {
            name: "arena-30000",
            image: "kyon/gameserver:v2",
            players: 0,
            zero_for: None,
            draining: false,
            age_seconds: 0,
        });
        assert!(!matches_desired(&stale, &deployment.spec, desired.as_deref()));

        stale.spec.env = vec![EnvVar {
            name: MAX_PLAYERS_ENV.into(),
            value: Some("64".into()),
            value_from: None,
        }];
        assert!(matches_desired(&stale, &deployment.spec, desired.as_deref()));
    }

    #[test]
    fn max_players_is_appended_or_overwritten() {
        let declared = vec![
            EnvVar {
                name: "MODE".into(),
                value: Some("ctf".into()),
                value_from: None,
            },
            EnvVar {
                name: MAX_PLAYERS_ENV.into(),
                value: Some("16".into()),
                value_from: None,
            },
        ];

        let merged = ensure_max_players(&declared, Some("64"));
        assert_eq!(merged.len(), 2);
        assert!(env_has(&merged, MAX_PLAYERS_ENV, "64"));
        assert!(env_has(&merged, "MODE", "ctf"));

        let appended = ensure_max_players(&declared[..1], Some("64"));
        assert_eq!(appended.len(), 2);
        assert_eq!(appended.last().unwrap().name, MAX_PLAYERS_ENV);

        assert_eq!(ensure_max_players(&declared, None), declared);
    }

    #[test]
    fn occupancy_threshold_is_inclusive() {
        let mut busy = child(ChildSpec {
            name: "arena-30000",
            image: "kyon/gameserver:v2",
            players: 80,
            zero_for: None,
            draining: false,
            age_seconds: 0,
        });

        assert!(over_threshold(std::slice::from_ref(&busy), 80));

        busy.status.as_mut().unwrap().players = 79;
        assert!(!over_threshold(std::slice::from_ref(&busy), 80));

        // A server that never reported capacity cannot trigger scale-up.
        busy.status.as_mut().unwrap().players = 500;
        busy.status.as_mut().unwrap().max_players = 0;
        assert!(!over_threshold(std::slice::from_ref(&busy), 80));
    }

    #[test]
    fn occupied_instances_are_never_deletion_candidates() {
        let now = Utc::now();
        let children = vec![
            child(ChildSpec {
                name: "arena-30000",
                image: "v1",
                players: 7,
                zero_for: None,
                draining: true,
                age_seconds: 600,
            }),
            child(ChildSpec {
                name: "arena-30001",
                image: "v2",
                players: 1,
                zero_for: Some(300),
                draining: false,
                age_seconds: 600,
            }),
        ];

        assert!(scale_down_candidates(&children, 60, &now).is_empty());
    }

    #[test]
    fn draining_instances_retire_as_soon_as_they_empty() {
        let now = Utc::now();
        let children = vec![child(ChildSpec {
            name: "arena-30000",
            image: "v1",
            players: 0,
            zero_for: None,
            draining: true,
            age_seconds: 5,
        })];

        assert_eq!(
            scale_down_candidates(&children, 60, &now),
            vec!["arena-30000"]
        );
    }

    #[test]
    fn idle_instances_wait_out_the_grace_period() {
        let now = Utc::now();
        let expired = child(ChildSpec {
            name: "arena-30000",
            image: "v2",
            players: 0,
            zero_for: Some(90),
            draining: false,
            age_seconds: 600,
        });
        let recent = child(ChildSpec {
            name: "arena-30001",
            image: "v2",
            players: 0,
            zero_for: Some(30),
            draining: false,
            age_seconds: 600,
        });
        let never_polled_zero = child(ChildSpec {
            name: "arena-30002",
            image: "v2",
            players: 0,
            zero_for: None,
            draining: false,
            age_seconds: 600,
        });

        let children = vec![recent, expired, never_polled_zero];
        assert_eq!(
            scale_down_candidates(&children, 60, &now),
            vec!["arena-30000"]
        );
    }

    #[test]
    fn candidates_are_ordered_oldest_first() {
        let now = Utc::now();
        let children = vec![
            child(ChildSpec {
                name: "arena-30002",
                image: "v2",
                players: 0,
                zero_for: Some(120),
                draining: false,
                age_seconds: 100,
            }),
            child(ChildSpec {
                name: "arena-30000",
                image: "v2",
                players: 0,
                zero_for: Some(120),
                draining: false,
                age_seconds: 900,
            }),
            child(ChildSpec {
                name: "arena-30001",
                image: "v2",
                players: 0,
                zero_for: Some(120),
                draining: false,
                age_seconds: 500,
            }),
        ];

        assert_eq!(
            scale_down_candidates(&children, 60, &now),
            vec!["arena-30000", "arena-30001", "arena-30002"]
        );
    }

    #[test]
    fn child_template_carries_the_current_spec() {
        let deployment = deployment(Some(64));
        let desired = deployment.spec.desired_max_players();
        let child = build_child(&deployment, 30003, desired.as_deref()).unwrap();

        assert_eq!(child.name_any(), "arena-30003");
        assert_eq!(child.spec.port, 30003);
        assert_eq!(child.spec.image.as_deref(), Some("kyon/gameserver:v2"));
        assert!(env_has(&child.spec.env, MAX_PLAYERS_ENV, "64"));
        assert_eq!(
            child.labels().get(OWNER_LABEL).map(String::as_str),
            Some("arena")
        );

        let owner = &child.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GSDeployment");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn child_without_uid_cannot_be_owned() {
        let mut deployment = deployment(None);
        deployment.metadata.uid = None;
        assert!(matches!(
            build_child(&deployment, 30000, None),
            Err(Error::MissingObjectKey("metadata.uid"))
        ));
    }
}
