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

//! Reconcilers for the two custom resources.
//!
//! The fleet controller converges a [`GSDeployment`]'s child set; the
//! instance controller keeps each [`GameServer`] backed by a workload pod and
//! reports its observed state. Both are level-triggered functions of current
//! state: they may be invoked arbitrarily often, in any order, and rely on
//! the runtime's per-object serialization instead of internal locking.

pub mod fleet;
pub mod gameserver;

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};

use crate::{
    api::{GSDeployment, GameServer},
    poll::StatusPoller,
};

/// State shared by every reconcile invocation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub poller: StatusPoller,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes api request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("object is missing {0}")]
    MissingObjectKey(&'static str),
    #[error("failed to serialize status: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Requeue delay per error kind. Transient API errors retry quickly; errors
/// that won't self-heal back off further.
pub(crate) fn error_policy<K>(_object: Arc<K>, error: &Error, _context: Arc<Context>) -> Action {
    let delay = match error {
        Error::Kube(_) => Duration::from_secs(10),
        Error::MissingObjectKey(_) | Error::Serialization(_) => Duration::from_secs(60),
    };
    Action::requeue(delay)
}

/// Drives both control loops until a shutdown signal arrives.
pub async fn run(context: Arc<Context>) {
    let deployments: Api<GSDeployment> = Api::all(context.client.clone());
    let gameservers: Api<GameServer> = Api::all(context.client.clone());
    let pods: Api<Pod> = Api::all(context.client.clone());

    let fleet_loop = Controller::new(deployments, watcher::Config::default())
        .owns(gameservers.clone(), watcher::Config::default())
        .shutdown_on_signal()
        .run(fleet::reconcile, error_policy, context.clone())
        .for_each(|result| async {
            match result {
                Ok((object, _)) => {
                    crate::metrics::reconciles_total("fleet").inc();
                    tracing::debug!(?object, "fleet reconcile complete");
                }
                Err(error) => {
                    crate::metrics::reconcile_errors_total("fleet").inc();
                    tracing::warn!(%error, "fleet reconcile failed");
                }
            }
        });

    let instance_loop = Controller::new(gameservers, watcher::Config::default())
        .owns(pods, watcher::Config::default())
        .shutdown_on_signal()
        .run(gameserver::reconcile, error_policy, context.clone())
        .for_each(|result| async {
            match result {
                Ok((object, _)) => {
                    crate::metrics::reconciles_total("instance").inc();
                    tracing::debug!(?object, "instance reconcile complete");
                }
                Err(error) => {
                    crate::metrics::reconcile_errors_total("instance").inc();
                    tracing::warn!(%error, "instance reconcile failed");
                }
            }
        });

    tokio::join!(fleet_loop, instance_loop);
}
