// SPDX-License-Identifier: BSD-3-Clause

//! Built-in API resource table.
//!
//! Compile-time type information from k8s-openapi covers the built-in kinds,
//! so resolving them needs no discovery round-trip and automatically stays
//! in sync with the Kubernetes API version the crate is built against.
//! Custom resources are handled separately via the per-cluster CRD snapshot.

use std::sync::OnceLock;

use kube::core::{GroupVersionKind, GroupVersionResource};

/// One discovered (or compiled-in) API resource entry.
#[derive(Debug, Clone)]
pub struct ApiResourceEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub singular: String,
    pub short_names: Vec<String>,
    pub namespaced: bool,
}

impl ApiResourceEntry {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::gvr(&self.group, &self.version, &self.plural)
    }

    /// Whether `name` addresses this entry as a table: plural, singular or
    /// short name (exact) or the kind itself (case-insensitive).
    pub fn matches_table_name(&self, name: &str) -> bool {
        self.plural == name
            || self.singular == name
            || self.short_names.iter().any(|s| s == name)
            || self.kind.eq_ignore_ascii_case(name)
    }
}

/// The built-in resource table, constructed once per process.
pub fn builtin_resources() -> &'static [ApiResourceEntry] {
    static TABLE: OnceLock<Vec<ApiResourceEntry>> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

fn build_table() -> Vec<ApiResourceEntry> {
    use k8s_openapi::api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        autoscaling::v2::HorizontalPodAutoscaler,
        batch::v1::{CronJob, Job},
        core::v1::{
            ConfigMap, Endpoints, Event, LimitRange, Namespace, Node, PersistentVolume,
            PersistentVolumeClaim, Pod, ResourceQuota, Secret, Service, ServiceAccount,
        },
        networking::v1::{Ingress, NetworkPolicy},
        policy::v1::PodDisruptionBudget,
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
        storage::v1::StorageClass,
    };
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::Resource;

    let mut table = Vec::new();

    // Compile-time group/version/kind/plural via the kube Resource trait;
    // scope and short names are not carried by the trait, so they are spelled
    // out here.
    macro_rules! entry {
        ($type:ty, namespaced, [$($short:expr),* $(,)?]) => {
            entry!(@inner $type, true, [$($short),*])
        };
        ($type:ty, cluster, [$($short:expr),* $(,)?]) => {
            entry!(@inner $type, false, [$($short),*])
        };
        (@inner $type:ty, $namespaced:expr, [$($short:expr),* $(,)?]) => {
            table.push(ApiResourceEntry {
                group: <$type>::group(&()).to_string(),
                version: <$type>::version(&()).to_string(),
                kind: <$type>::kind(&()).to_string(),
                plural: <$type>::plural(&()).to_string(),
                singular: <$type>::kind(&()).to_lowercase(),
                short_names: vec![$($short.to_string()),*],
                namespaced: $namespaced,
            });
        };
    }

    // Core API (v1), namespaced
    entry!(Pod, namespaced, ["po"]);
    entry!(Service, namespaced, ["svc"]);
    entry!(ConfigMap, namespaced, ["cm"]);
    entry!(Secret, namespaced, []);
    entry!(Event, namespaced, ["ev"]);
    entry!(ServiceAccount, namespaced, ["sa"]);
    entry!(Endpoints, namespaced, ["ep"]);
    entry!(PersistentVolumeClaim, namespaced, ["pvc"]);
    entry!(ResourceQuota, namespaced, ["quota"]);
    entry!(LimitRange, namespaced, ["limits"]);

    // Core API (v1), cluster-scoped
    entry!(Node, cluster, ["no"]);
    entry!(Namespace, cluster, ["ns"]);
    entry!(PersistentVolume, cluster, ["pv"]);

    // apps/v1
    entry!(Deployment, namespaced, ["deploy"]);
    entry!(StatefulSet, namespaced, ["sts"]);
    entry!(DaemonSet, namespaced, ["ds"]);
    entry!(ReplicaSet, namespaced, ["rs"]);

    // batch/v1
    entry!(Job, namespaced, []);
    entry!(CronJob, namespaced, ["cj"]);

    // networking.k8s.io/v1
    entry!(Ingress, namespaced, ["ing"]);
    entry!(NetworkPolicy, namespaced, ["netpol"]);

    // autoscaling/v2
    entry!(HorizontalPodAutoscaler, namespaced, ["hpa"]);

    // policy/v1
    entry!(PodDisruptionBudget, namespaced, ["pdb"]);

    // storage.k8s.io/v1
    entry!(StorageClass, cluster, ["sc"]);

    // rbac.authorization.k8s.io/v1
    entry!(Role, namespaced, []);
    entry!(RoleBinding, namespaced, []);
    entry!(ClusterRole, cluster, []);
    entry!(ClusterRoleBinding, cluster, []);

    // apiextensions.k8s.io/v1, so `crds` resolves as a table itself
    entry!(CustomResourceDefinition, cluster, ["crd", "crds"]);

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_entry_is_present_and_namespaced() {
        let pod = builtin_resources()
            .iter()
            .find(|e| e.kind == "Pod")
            .expect("Pod entry");
        assert_eq!(pod.plural, "pods");
        assert_eq!(pod.group, "");
        assert_eq!(pod.version, "v1");
        assert!(pod.namespaced);
    }

    #[test]
    fn table_name_matching_covers_all_name_forms() {
        let deploy = builtin_resources()
            .iter()
            .find(|e| e.kind == "Deployment")
            .unwrap();
        assert!(deploy.matches_table_name("deployments"));
        assert!(deploy.matches_table_name("deployment"));
        assert!(deploy.matches_table_name("deploy"));
        assert!(deploy.matches_table_name("Deployment"));
        assert!(!deploy.matches_table_name("deployz"));
    }

    #[test]
    fn cluster_scoped_kinds_are_flagged() {
        let node = builtin_resources()
            .iter()
            .find(|e| e.kind == "Node")
            .unwrap();
        assert!(!node.namespaced);
    }
}
