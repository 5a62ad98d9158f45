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

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use kube::CustomResourceExt;
use kube_leader_election::{LeaseLock, LeaseLockParams};

use crate::{
    api::{GSDeployment, GameServer},
    controllers::{self, Context},
    poll::StatusPoller,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lease name distinguishing this operator's election from anything else in
/// the namespace.
const ELECTION_ID: &str = "gameserver-operator.game.example.com";

#[derive(clap::Parser)]
pub struct Cli {
    #[clap(
        long,
        env = "METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080",
        help = "The address the metrics endpoint binds to."
    )]
    metrics_bind_address: SocketAddr,
    #[clap(
        long,
        env = "HEALTH_PROBE_BIND_ADDRESS",
        default_value = "0.0.0.0:8081",
        help = "The address the health probe endpoint binds to."
    )]
    health_probe_bind_address: SocketAddr,
    #[clap(
        long,
        env,
        help = "Hold a leadership lease before reconciling, so at most one replica is active."
    )]
    leader_elect: bool,
    #[clap(
        short,
        long,
        env,
        help = "Whether the operator will report any results to stdout/stderr."
    )]
    quiet: bool,
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run both control loops (the default).
    Run,
    /// Print the CustomResourceDefinition manifests and exit.
    Crds,
}

impl Cli {
    /// Drives the operator lifecycle using the command line arguments.
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }

        match &self.command {
            Some(Commands::Crds) => generate_crds(),
            Some(Commands::Run) | None => {
                tracing::info!(version = &*version, "starting gameserver operator");
                self.run().await
            }
        }
    }

    async fn run(&self) -> crate::Result<()> {
        let client = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            kube::Client::try_default(),
        )
        .await??;

        let live = Arc::new(AtomicBool::new(false));
        crate::admin::spawn_metrics(self.metrics_bind_address);
        crate::admin::spawn_probes(self.health_probe_bind_address, live.clone());

        if self.leader_elect {
            let lease = acquire_leadership(client.clone()).await;
            tokio::spawn(hold_leadership(lease));
        }

        let context = Arc::new(Context {
            client,
            poller: StatusPoller::new(),
        });

        live.store(true, Ordering::SeqCst);
        controllers::run(context).await;
        Ok(())
    }
}

fn generate_crds() -> crate::Result<()> {
    print!(
        "{}---\n{}",
        serde_yaml::to_string(&GameServer::crd())?,
        serde_yaml::to_string(&GSDeployment::crd())?
    );
    Ok(())
}

/// Blocks until this replica holds the leadership lease.
async fn acquire_leadership(client: kube::Client) -> LeaseLock {
    let namespace = client.default_namespace().to_string();
    let holder_id =
        std::env::var("HOSTNAME").unwrap_or_else(|_| "gameserver-operator".to_string());
    let leadership = LeaseLock::new(
        client,
        &namespace,
        LeaseLockParams {
            holder_id,
            lease_name: ELECTION_ID.into(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    loop {
        match leadership.try_acquire_or_renew().await {
            Ok(lease) if lease.acquired_lease => {
                tracing::info!(lease = ELECTION_ID, "acquired leadership");
                return leadership;
            }
            Ok(_) => tracing::debug!(lease = ELECTION_ID, "waiting for leadership"),
            Err(error) => tracing::warn!(%error, "leader election attempt failed"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

/// Renews the lease for as long as the process runs. Losing the lease is
/// surfaced in logs; the replacement leader takes over through the same
/// election.
async fn hold_leadership(leadership: LeaseLock) {
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        if let Err(error) = leadership.try_acquire_or_renew().await {
            tracing::warn!(%error, "failed to renew leadership lease");
        }
    }
}
