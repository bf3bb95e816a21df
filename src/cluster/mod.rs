// SPDX-License-Identifier: BSD-3-Clause

//! Per-cluster connection state and lifecycle.
//!
//! A [`ClusterInst`] owns everything one cluster needs: the client, the TTL
//! cache, the CRD snapshot the resolver consults, the per-verb callback
//! chains, and the cancel handles of its background tasks. Instances are
//! created by the registry, mutated by watch refreshes, and torn down
//! deterministically on removal.

mod credential;
mod registry;
mod watch;

pub use credential::{CredentialProvider, Token};
pub use registry::{
    cluster, clusters, default_cluster, ClusterRegistry, RegisterCallback, RegisterOptions,
    TeardownHook, IN_CLUSTER_ID,
};

use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheConfig, ClusterCache};
use crate::callback::Callbacks;
use crate::error::Result;
use crate::resolver::{Resolved, Resolver};

/// A background task plus its cancellation handle.
pub(crate) struct TaskHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TaskHandle {
    /// Cancel and detach. Abort after cancelling bounds teardown time even
    /// if the task is blocked on I/O.
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// One registered cluster: connection, cache, snapshots, pipelines and
/// background-task handles. Owned exclusively by the [`ClusterRegistry`].
pub struct ClusterInst {
    id: String,
    client: Client,
    config: Option<kube::Config>,
    cache: ClusterCache,
    callbacks: Callbacks,
    /// CRD snapshot maintained by the background watch; read-mostly.
    crds: RwLock<Vec<CustomResourceDefinition>>,
    /// Memoized kind-to-GVR resolutions; cleared by `Resolver::clear_cache`
    /// and on CRD snapshot changes.
    pub(crate) resolve_cache: DashMap<String, Resolved>,
    credential: Option<Arc<dyn CredentialProvider>>,
    crd_watch: Mutex<Option<TaskHandle>>,
    credential_refresh: Mutex<Option<TaskHandle>>,
    teardown_hooks: Mutex<Vec<TeardownHook>>,
}

impl ClusterInst {
    pub(crate) fn new(
        id: impl Into<String>,
        client: Client,
        config: Option<kube::Config>,
        cache_config: &CacheConfig,
        credential: Option<Arc<dyn CredentialProvider>>,
    ) -> Self {
        let callbacks = Callbacks::new();
        crate::steps::register_defaults(&callbacks);
        Self {
            id: id.into(),
            client,
            config,
            cache: ClusterCache::new(cache_config),
            callbacks,
            crds: RwLock::new(Vec::new()),
            resolve_cache: DashMap::new(),
            credential,
            crd_watch: Mutex::new(None),
            credential_refresh: Mutex::new(None),
            teardown_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn config(&self) -> Option<&kube::Config> {
        self.config.as_ref()
    }

    pub fn cache(&self) -> &ClusterCache {
        &self.cache
    }

    /// The per-verb callback chains of this cluster.
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Resolution view over this cluster's built-in table and CRD snapshot.
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }

    /// Current CRD snapshot (cloned; the snapshot itself is read-mostly).
    pub fn crd_snapshot(&self) -> Vec<CustomResourceDefinition> {
        self.crds.read().expect("crd snapshot lock poisoned").clone()
    }

    pub(crate) fn replace_crds(&self, crds: Vec<CustomResourceDefinition>) {
        *self.crds.write().expect("crd snapshot lock poisoned") = crds;
        self.resolve_cache.clear();
    }

    pub(crate) fn upsert_crd(&self, crd: CustomResourceDefinition) {
        let mut crds = self.crds.write().expect("crd snapshot lock poisoned");
        let name = crd.metadata.name.clone();
        crds.retain(|c| c.metadata.name != name);
        crds.push(crd);
        drop(crds);
        self.resolve_cache.clear();
    }

    pub(crate) fn remove_crd(&self, name: &str) {
        let mut crds = self.crds.write().expect("crd snapshot lock poisoned");
        crds.retain(|c| c.metadata.name.as_deref() != Some(name));
        drop(crds);
        self.resolve_cache.clear();
    }

    /// Server version, cached in the cluster cache after the first call.
    pub async fn server_version(&self) -> Result<Info> {
        const KEY: &str = "cluster:server-version";
        if let Some(info) = self.cache.get::<Info>(KEY).await {
            return Ok((*info).clone());
        }
        let info = self.client.apiserver_version().await?;
        self.cache.insert(KEY, info.clone()).await;
        Ok(info)
    }

    /// Fetch a valid credential token before issuing a request, when this
    /// cluster's connection requires one. Reads the provider's cached token
    /// when valid; otherwise performs a synchronous fetch with bounded
    /// retries.
    pub async fn ensure_token(&self) -> Result<Option<Token>> {
        match &self.credential {
            Some(provider) => credential::token_with_retry(provider.as_ref())
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn start_crd_watch(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let task = watch::spawn_crd_watch(Arc::clone(self), cancel.clone());
        *self.crd_watch.lock().expect("task handle lock poisoned") =
            Some(TaskHandle { cancel, task });
    }

    pub(crate) fn start_credential_refresh(self: &Arc<Self>) {
        let Some(provider) = self.credential.clone() else {
            return;
        };
        let cancel = CancellationToken::new();
        let task = credential::spawn_refresh(provider, cancel.clone());
        *self
            .credential_refresh
            .lock()
            .expect("task handle lock poisoned") = Some(TaskHandle { cancel, task });
    }

    /// Register a hook to run once when this cluster is removed from its
    /// registry, before cached state is released.
    pub fn push_teardown(&self, hook: TeardownHook) {
        self.teardown_hooks
            .lock()
            .expect("teardown lock poisoned")
            .push(hook);
    }

    /// Cancel background tasks, run registered teardown hooks and release
    /// cached state. Called by the registry before the instance leaves the
    /// directory; safe to call more than once.
    pub(crate) fn shutdown(&self) {
        debug!(cluster = %self.id, "shutting down cluster");
        if let Some(handle) = self.crd_watch.lock().expect("task handle lock poisoned").take() {
            handle.stop();
        }
        if let Some(handle) = self
            .credential_refresh
            .lock()
            .expect("task handle lock poisoned")
            .take()
        {
            handle.stop();
        }
        let hooks: Vec<TeardownHook> = self
            .teardown_hooks
            .lock()
            .expect("teardown lock poisoned")
            .drain(..)
            .collect();
        for hook in hooks {
            hook();
        }
        self.cache.clear();
        self.resolve_cache.clear();
        self.crds.write().expect("crd snapshot lock poisoned").clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use http::{Request, Response};
    use kube::client::Body;
    use tower_test::mock;

    /// A client backed by a mock service that is never driven; requests
    /// against it fail, which is fine for tests exercising the pipeline
    /// with fake step handlers.
    pub(crate) fn mock_client() -> Client {
        let (svc, handle) = mock::pair::<Request<Body>, Response<Body>>();
        drop(handle);
        Client::new(svc, "default")
    }
}

#[cfg(test)]
impl ClusterInst {
    /// A cluster with a mock client and no background tasks, for unit tests.
    pub(crate) fn fake_for_tests(id: &str) -> Arc<Self> {
        Arc::new(Self::new(
            id,
            test_support::mock_client(),
            None,
            &CacheConfig::default(),
            None,
        ))
    }

    /// A clone of the running CRD watch's cancellation token, for asserting
    /// that teardown actually cancels it.
    pub(crate) fn crd_watch_cancel(&self) -> Option<CancellationToken> {
        self.crd_watch
            .lock()
            .expect("task handle lock poisoned")
            .as_ref()
            .map(|h| h.cancel.clone())
    }
}
