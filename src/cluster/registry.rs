// SPDX-License-Identifier: BSD-3-Clause

//! The multi-cluster directory.
//!
//! A [`ClusterRegistry`] owns every registered cluster by ID. Registration
//! is idempotent per ID, removal tears the instance down deterministically,
//! and a process-wide singleton backs the top-level [`cluster`] /
//! [`default_cluster`] entry points.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kube::{Client, Config};
use tracing::{debug, info};

use crate::cache::CacheConfig;
use crate::cluster::{ClusterInst, CredentialProvider};
use crate::error::{Error, Result};
use crate::kubectl::Kubectl;

/// Identifier reserved for the cluster the process itself runs in.
pub const IN_CLUSTER_ID: &str = "InCluster";

/// Invoked after each successful registration, with the new instance.
pub type RegisterCallback = Arc<dyn Fn(&Arc<ClusterInst>) + Send + Sync>;

/// Runs once during cluster removal, before cached state is released.
pub type TeardownHook = Box<dyn FnOnce() + Send>;

/// Per-registration tuning, applied on top of the supplied [`Config`].
/// Options belong to the first registration of an ID; re-registering an
/// existing ID returns the existing instance and ignores them.
#[derive(Default)]
pub struct RegisterOptions {
    cache: CacheConfig,
    impersonate_user: Option<String>,
    impersonate_groups: Vec<String>,
    proxy_url: Option<http::Uri>,
    /// Additional trust roots, DER-encoded.
    ca_certs: Vec<Vec<u8>>,
    connect_timeout: Option<Duration>,
    disable_crd_watch: bool,
    credential_provider: Option<Arc<dyn CredentialProvider>>,
}

impl RegisterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn impersonate(mut self, user: impl Into<String>) -> Self {
        self.impersonate_user = Some(user.into());
        self
    }

    pub fn impersonate_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.impersonate_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn proxy_url(mut self, url: http::Uri) -> Self {
        self.proxy_url = Some(url);
        self
    }

    pub fn ca_cert_der(mut self, der: Vec<u8>) -> Self {
        self.ca_certs.push(der);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Skip the background CRD watch; resolution then only sees CRDs pushed
    /// in by hand.
    pub fn disable_crd_watch(mut self) -> Self {
        self.disable_crd_watch = true;
        self
    }

    pub fn credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    fn apply_to_config(&self, config: &mut Config) {
        if let Some(user) = &self.impersonate_user {
            config.auth_info.impersonate = Some(user.clone());
        }
        if !self.impersonate_groups.is_empty() {
            config.auth_info.impersonate_groups = Some(self.impersonate_groups.clone());
        }
        if let Some(url) = &self.proxy_url {
            config.proxy_url = Some(url.clone());
        }
        for der in &self.ca_certs {
            config.root_cert.get_or_insert_with(Vec::new).push(der.clone());
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = Some(timeout);
        }
    }
}

/// Directory of registered clusters.
pub struct ClusterRegistry {
    clusters: DashMap<String, Arc<ClusterInst>>,
    register_callback: RwLock<Option<RegisterCallback>>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self {
            clusters: DashMap::new(),
            register_callback: RwLock::new(None),
        }
    }

    /// Register under the default ID: the cluster URL of the config.
    pub async fn register_by_config(
        &self,
        config: Config,
        options: RegisterOptions,
    ) -> Result<Arc<ClusterInst>> {
        let id = config.cluster_url.to_string();
        self.register_by_config_with_id(&id, config, options).await
    }

    /// Register the cluster this process runs inside, as [`IN_CLUSTER_ID`].
    pub async fn register_in_cluster(
        &self,
        options: RegisterOptions,
    ) -> Result<Arc<ClusterInst>> {
        let config = Config::incluster()
            .map_err(|e| Error::credential(format!("in-cluster config: {e}")))?;
        self.register_by_config_with_id(IN_CLUSTER_ID, config, options)
            .await
    }

    /// Register a cluster under `id`. Idempotent: if `id` is already
    /// registered the existing instance is returned and `options` are
    /// ignored.
    pub async fn register_by_config_with_id(
        &self,
        id: &str,
        mut config: Config,
        options: RegisterOptions,
    ) -> Result<Arc<ClusterInst>> {
        if let Some(existing) = self.clusters.get(id) {
            debug!(cluster = %id, "already registered, reusing instance");
            return Ok(existing.clone());
        }
        options.apply_to_config(&mut config);
        let client = Client::try_from(config.clone())?;
        let inst = Arc::new(ClusterInst::new(
            id,
            client,
            Some(config),
            &options.cache,
            options.credential_provider.clone(),
        ));
        self.finish_registration(id, inst, &options)
    }

    /// Register from a pre-built client. The instance carries no [`Config`];
    /// everything else behaves as [`register_by_config_with_id`].
    ///
    /// [`register_by_config_with_id`]: Self::register_by_config_with_id
    pub fn register_by_client_with_id(
        &self,
        id: &str,
        client: Client,
        options: RegisterOptions,
    ) -> Result<Arc<ClusterInst>> {
        if let Some(existing) = self.clusters.get(id) {
            debug!(cluster = %id, "already registered, reusing instance");
            return Ok(existing.clone());
        }
        let inst = Arc::new(ClusterInst::new(
            id,
            client,
            None,
            &options.cache,
            options.credential_provider.clone(),
        ));
        self.finish_registration(id, inst, &options)
    }

    fn finish_registration(
        &self,
        id: &str,
        inst: Arc<ClusterInst>,
        options: &RegisterOptions,
    ) -> Result<Arc<ClusterInst>> {
        // Entry-level race: two concurrent registrations of the same ID must
        // converge on one instance.
        let inst = match self.clusters.entry(id.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(inst.clone());
                inst
            }
        };
        if !options.disable_crd_watch {
            inst.start_crd_watch();
        }
        inst.start_credential_refresh();
        info!(cluster = %id, "cluster registered");
        if let Some(callback) = self
            .register_callback
            .read()
            .expect("register callback lock poisoned")
            .as_ref()
        {
            callback(&inst);
        }
        Ok(inst)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ClusterInst>> {
        self.clusters.get(id).map(|e| e.clone())
    }

    /// Registered cluster IDs, sorted.
    pub fn all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// The default cluster: in-cluster first, then the one registered as
    /// "default", then any (first in sorted ID order).
    pub fn default(&self) -> Option<Arc<ClusterInst>> {
        if let Some(inst) = self.get(IN_CLUSTER_ID) {
            return Some(inst);
        }
        if let Some(inst) = self.get("default") {
            return Some(inst);
        }
        let id = self.all().into_iter().next()?;
        self.get(&id)
    }

    /// Remove and tear down a cluster. A no-op for unknown IDs.
    pub fn remove(&self, id: &str) {
        let Some(inst) = self.get(id) else {
            return;
        };
        // Shut down before unlinking so in-flight lookups that already hold
        // the Arc see an emptied instance rather than a half-dead one.
        inst.shutdown();
        self.clusters.remove(id);
        info!(cluster = %id, "cluster removed");
    }

    pub fn set_register_callback(&self, callback: RegisterCallback) {
        *self
            .register_callback
            .write()
            .expect("register callback lock poisoned") = Some(callback);
    }

    /// One-line summary per cluster, for diagnostics.
    pub fn summary(&self) -> HashMap<String, usize> {
        self.clusters
            .iter()
            .map(|e| (e.key().clone(), e.value().crd_snapshot().len()))
            .collect()
    }
}

/// The process-wide registry.
pub fn clusters() -> &'static ClusterRegistry {
    static REGISTRY: OnceLock<ClusterRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ClusterRegistry::new)
}

/// A query handle on the named cluster from the process-wide registry.
pub fn cluster(id: &str) -> Option<Kubectl> {
    clusters().get(id).map(Kubectl::new)
}

/// A query handle on the default cluster from the process-wide registry.
pub fn default_cluster() -> Option<Kubectl> {
    clusters().default().map(Kubectl::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_support::mock_client;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn register(registry: &ClusterRegistry, id: &str) -> Arc<ClusterInst> {
        registry
            .register_by_client_with_id(id, mock_client(), RegisterOptions::new().disable_crd_watch())
            .unwrap()
    }

    #[tokio::test]
    async fn registration_is_idempotent_per_id() {
        let registry = ClusterRegistry::new();
        let first = register(&registry, "alpha");
        let second = register(&registry, "alpha");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.all(), vec!["alpha".to_string()]);

        let summary = registry.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary.get("alpha"), Some(&0));
    }

    #[tokio::test]
    async fn default_prefers_in_cluster_then_default_then_any() {
        let registry = ClusterRegistry::new();
        register(&registry, "zeta");
        assert_eq!(registry.default().unwrap().id(), "zeta");

        register(&registry, "default");
        assert_eq!(registry.default().unwrap().id(), "default");

        register(&registry, IN_CLUSTER_ID);
        assert_eq!(registry.default().unwrap().id(), IN_CLUSTER_ID);
    }

    #[tokio::test]
    async fn remove_runs_teardown_and_is_idempotent() {
        let registry = ClusterRegistry::new();
        let inst = register(&registry, "alpha");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        inst.push_teardown(Box::new(move || flag.store(true, Ordering::SeqCst)));

        registry.remove("alpha");
        assert!(fired.load(Ordering::SeqCst));
        assert!(registry.get("alpha").is_none());

        // Second removal must be a no-op.
        registry.remove("alpha");
    }

    #[tokio::test]
    async fn remove_cancels_the_crd_watch_task() {
        let registry = ClusterRegistry::new();
        // Watch enabled: the mock client fails every request, which the
        // watcher absorbs under its backoff until cancelled.
        let inst = registry
            .register_by_client_with_id("alpha", mock_client(), RegisterOptions::new())
            .unwrap();
        let cancel = inst.crd_watch_cancel().expect("crd watch should be running");
        assert!(!cancel.is_cancelled());

        registry.remove("alpha");
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn register_callback_fires_once_per_new_cluster() {
        let registry = ClusterRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        registry.set_register_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        register(&registry, "alpha");
        register(&registry, "alpha");
        register(&registry, "beta");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
