// SPDX-License-Identifier: BSD-3-Clause

//! Kind and table-name resolution.
//!
//! A [`Resolver`] maps what a caller wrote (a typed kind, a GVK, or a SQL
//! table name) to the concrete group/version/resource plus scope the API
//! machinery needs. Built-in kinds come from the compile-time table in
//! [`crate::builtin`]; everything else is looked up in the cluster's CRD
//! snapshot. Successful resolutions are memoized per cluster and invalidated
//! whenever the snapshot changes.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::{GroupVersionKind, GroupVersionResource};
use tracing::debug;

use crate::builtin::builtin_resources;
use crate::cluster::ClusterInst;
use crate::error::{Error, Result};

/// A fully resolved resource: where it lives and whether it is namespaced.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub gvk: GroupVersionKind,
    pub gvr: GroupVersionResource,
    pub namespaced: bool,
}

/// Resolution view over one cluster's built-in table and CRD snapshot.
pub struct Resolver<'c> {
    cluster: &'c ClusterInst,
}

impl<'c> Resolver<'c> {
    pub(crate) fn new(cluster: &'c ClusterInst) -> Self {
        Self { cluster }
    }

    /// Whether `kind` names a built-in resource (case-insensitive kind,
    /// or any of its table names).
    pub fn is_builtin_resource(&self, kind: &str) -> bool {
        builtin_resources()
            .iter()
            .any(|e| e.kind.eq_ignore_ascii_case(kind) || e.matches_table_name(kind))
    }

    /// Whether the exact GVK is served by a built-in type.
    pub fn is_builtin_resource_by_gvk(&self, gvk: &GroupVersionKind) -> bool {
        builtin_resources().iter().any(|e| {
            e.group == gvk.group && e.version == gvk.version && e.kind == gvk.kind
        })
    }

    /// Resolve a bare kind name, built-ins first, then the CRD snapshot.
    pub fn resolve_kind(&self, kind: &str) -> Result<Resolved> {
        let key = format!("kind:{kind}");
        if let Some(hit) = self.cluster.resolve_cache.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = self.resolve_kind_uncached(kind)?;
        self.cluster.resolve_cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn resolve_kind_uncached(&self, kind: &str) -> Result<Resolved> {
        if let Some(entry) = builtin_resources()
            .iter()
            .find(|e| e.kind.eq_ignore_ascii_case(kind))
        {
            return Ok(Resolved {
                gvk: entry.gvk(),
                gvr: entry.gvr(),
                namespaced: entry.namespaced,
            });
        }
        let crds = self.cluster.crd_snapshot();
        if let Some(crd) = crds
            .iter()
            .find(|c| c.spec.names.kind.eq_ignore_ascii_case(kind))
        {
            return resolved_from_crd(crd);
        }
        Err(Error::resolution(format!(
            "kind {kind:?} not found among built-in resources or CRDs on cluster {}",
            self.cluster.id()
        )))
    }

    /// Resolve a full GVK. Built-in types match on the exact triple; CRDs
    /// match on group and kind, with the version validated against the
    /// served versions.
    pub fn resolve_gvk(&self, gvk: &GroupVersionKind) -> Result<Resolved> {
        let key = format!("gvk:{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = self.cluster.resolve_cache.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = self.resolve_gvk_uncached(gvk)?;
        self.cluster.resolve_cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn resolve_gvk_uncached(&self, gvk: &GroupVersionKind) -> Result<Resolved> {
        if let Some(entry) = builtin_resources().iter().find(|e| {
            e.group == gvk.group && e.version == gvk.version && e.kind == gvk.kind
        }) {
            return Ok(Resolved {
                gvk: entry.gvk(),
                gvr: entry.gvr(),
                namespaced: entry.namespaced,
            });
        }
        let crds = self.cluster.crd_snapshot();
        if let Some(crd) = crds
            .iter()
            .find(|c| c.spec.group == gvk.group && c.spec.names.kind == gvk.kind)
        {
            if !gvk.version.is_empty()
                && !crd.spec.versions.iter().any(|v| v.served && v.name == gvk.version)
            {
                return Err(Error::resolution(format!(
                    "version {:?} of {}/{} is not served",
                    gvk.version, gvk.group, gvk.kind
                )));
            }
            let mut resolved = resolved_from_crd(crd)?;
            if !gvk.version.is_empty() {
                resolved.gvk.version = gvk.version.clone();
                resolved.gvr.version = gvk.version.clone();
            }
            return Ok(resolved);
        }
        Err(Error::resolution(format!(
            "{}/{}/{} not found among built-in resources or CRDs on cluster {}",
            gvk.group,
            gvk.version,
            gvk.kind,
            self.cluster.id()
        )))
    }

    /// Resolve a SQL table name: plural, singular, short name or kind.
    /// Built-ins take precedence over CRDs on a clash.
    pub fn resolve_table_name(&self, table: &str) -> Result<Resolved> {
        let key = format!("table:{table}");
        if let Some(hit) = self.cluster.resolve_cache.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = self
            .find_in_builtins(table)
            .map(Ok)
            .or_else(|| self.find_in_crds(table))
            .unwrap_or_else(|| {
                Err(Error::resolution(format!(
                    "unknown table {table:?} on cluster {}; see available table names",
                    self.cluster.id()
                )))
            })?;
        debug!(table, gvr = ?resolved.gvr, "resolved table name");
        self.cluster.resolve_cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn find_in_builtins(&self, table: &str) -> Option<Resolved> {
        builtin_resources()
            .iter()
            .find(|e| e.matches_table_name(table))
            .map(|e| Resolved {
                gvk: e.gvk(),
                gvr: e.gvr(),
                namespaced: e.namespaced,
            })
    }

    fn find_in_crds(&self, table: &str) -> Option<Result<Resolved>> {
        let crds = self.cluster.crd_snapshot();
        let crd = crds.iter().find(|c| {
            let names = &c.spec.names;
            names.plural == table
                || names.singular.as_deref() == Some(table)
                || names
                    .short_names
                    .as_ref()
                    .is_some_and(|s| s.iter().any(|n| n == table))
                || names.kind.eq_ignore_ascii_case(table)
        })?;
        Some(resolved_from_crd(crd))
    }

    /// Look up a CRD in the snapshot by kind and group.
    pub fn crd(&self, kind: &str, group: &str) -> Result<CustomResourceDefinition> {
        self.cluster
            .crd_snapshot()
            .into_iter()
            .find(|c| c.spec.group == group && c.spec.names.kind == kind)
            .ok_or_else(|| {
                Error::resolution(format!("CRD {kind}.{group} not found in snapshot"))
            })
    }

    /// Every addressable table name on this cluster: built-in plurals,
    /// singulars and short names plus the same for every CRD in the
    /// snapshot. Sorted and deduplicated.
    pub fn available_table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in builtin_resources() {
            names.push(entry.plural.clone());
            names.push(entry.singular.clone());
            names.extend(entry.short_names.iter().cloned());
        }
        for crd in self.cluster.crd_snapshot() {
            names.push(crd.spec.names.plural.clone());
            if let Some(singular) = &crd.spec.names.singular {
                names.push(singular.clone());
            }
            if let Some(shorts) = &crd.spec.names.short_names {
                names.extend(shorts.iter().cloned());
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Drop every memoized resolution and the response cache for this
    /// cluster.
    pub fn clear_cache(&self) {
        self.cluster.resolve_cache.clear();
        self.cluster.cache().clear();
    }
}

/// Pick the storage version of a CRD (falling back to any served version)
/// and build the resolution from its names and scope.
fn resolved_from_crd(crd: &CustomResourceDefinition) -> Result<Resolved> {
    let version = crd
        .spec
        .versions
        .iter()
        .find(|v| v.served && v.storage)
        .or_else(|| crd.spec.versions.iter().find(|v| v.served))
        .ok_or_else(|| {
            Error::resolution(format!(
                "CRD {} has no served version",
                crd.metadata.name.as_deref().unwrap_or("<unnamed>")
            ))
        })?;
    let namespaced = crd.spec.scope == "Namespaced";
    Ok(Resolved {
        gvk: GroupVersionKind::gvk(&crd.spec.group, &version.name, &crd.spec.names.kind),
        gvr: GroupVersionResource::gvr(&crd.spec.group, &version.name, &crd.spec.names.plural),
        namespaced,
    })
}
