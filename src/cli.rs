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

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    allocation::Allocator,
    cache::AllocationCache,
    reconcile::{FleetReconciler, SetCatalog},
    store::{KubernetesStore, Store},
    Config,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Functionally infinite retries: the component tasks are long running and
/// the process can be up for days or weeks.
const RETRIES: u32 = u32::MAX;
const BACKOFF_STEP: std::time::Duration = std::time::Duration::from_millis(250);
const MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(2);

/// The command-line interface for the billet controller and allocation service.
#[derive(Debug, clap::Parser)]
#[command(version, about)]
pub struct Cli {
    /// The path to the configuration file.
    #[clap(short, long, env = "BILLET_CONFIG", default_value = "billet.yaml")]
    pub config: PathBuf,
    /// Whether to spawn the admin server or not.
    #[clap(long, env)]
    pub no_admin: bool,
    /// The address to bind for the admin server.
    #[clap(long, env = "BILLET_ADMIN_ADDRESS")]
    pub admin_address: Option<SocketAddr>,
    /// The namespace whose game servers this instance manages.
    #[clap(long, env = "BILLET_NAMESPACE")]
    pub namespace: Option<String>,
    /// The address to bind for the allocation endpoint.
    #[clap(long, env = "BILLET_ALLOCATION_ADDRESS")]
    pub allocation_address: Option<SocketAddr>,
    /// Whether billet will report any results to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
}

impl Cli {
    /// Drives the main application lifecycle using the command line arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = VERSION, "starting billet");

        let mut config = Config::read(&self.config)?;
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(address) = self.allocation_address {
            config.allocation_address = address;
        }
        if self.admin_address.is_some() {
            config.admin_address = self.admin_address;
        }
        let config = Arc::new(config);

        let ready = Arc::new(AtomicBool::new(false));
        let shutdown = crate::signal::spawn_handler();

        let store: Arc<dyn Store> =
            Arc::new(KubernetesStore::connect(&config.namespace).await?);
        let cache = Arc::new(AllocationCache::new());
        let sets = Arc::new(SetCatalog::new());
        let allocator = Arc::new(Allocator::new(cache.clone(), sets.clone(), store.clone()));
        let reconciler = Arc::new(FleetReconciler::new(
            store.clone(),
            cache.clone(),
            sets,
            config.reconcile_interval(),
        ));

        let mut tasks = tokio::task::JoinSet::new();

        if !self.no_admin {
            let config = config.clone();
            let ready = ready.clone();
            let address = config.admin_address;
            let shutdown = shutdown.clone();
            tasks.spawn(supervised("admin", ready.clone(), move || {
                crate::admin::server(config.clone(), ready.clone(), address, shutdown.clone())
            }));
        }

        tasks.spawn(supervised("cache_feed", ready.clone(), {
            let cache = cache.clone();
            let store = store.clone();
            let shutdown = shutdown.clone();
            move || cache.clone().drive(store.clone(), shutdown.clone())
        }));

        tasks.spawn(supervised("reconciler", ready.clone(), {
            let shutdown = shutdown.clone();
            move || {
                let reconciler = reconciler.clone();
                let shutdown = shutdown.clone();
                async move { reconciler.run(shutdown).await }
            }
        }));

        tasks.spawn(supervised("allocation_service", ready.clone(), {
            let address = config.allocation_address;
            let shutdown = shutdown.clone();
            move || crate::service::serve(allocator.clone(), address, shutdown.clone())
        }));

        // Readiness mirrors the cache's initial sync: until the first full
        // listing is applied this instance cannot answer allocations.
        tasks.spawn({
            let ready = ready.clone();
            let mut shutdown = shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(()),
                        _ = ticker.tick() => ready.store(cache.is_synced(), Ordering::SeqCst),
                    }
                }
            }
        });

        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        Ok(())
    }
}

/// Keeps a component task alive with exponential backoff, flipping the
/// readiness flag off while it is down.
async fn supervised<F>(
    name: &'static str,
    ready: Arc<AtomicBool>,
    task: impl FnMut() -> F,
) -> crate::Result<()>
where
    F: std::future::Future<Output = crate::Result<()>>,
{
    tryhard::retry_fn(task)
        .retries(RETRIES)
        .exponential_backoff(BACKOFF_STEP)
        .max_delay(MAX_DELAY)
        .on_retry(|attempt, _, error: &eyre::Error| {
            ready.store(false, Ordering::SeqCst);
            let error = error.to_string();
            async move {
                tracing::warn!(%attempt, %error, task = name, "task error, retrying");
            }
        })
        .await
}
