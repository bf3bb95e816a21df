// SPDX-License-Identifier: BSD-3-Clause

//! Per-request statement: the context object threaded through the pipeline.
//!
//! A statement is a plain value, cheap to clone; every fluent branch point
//! clones it (copy-on-branch), so two live chains never share mutable query
//! state. Only the cluster identity is shared, via the handle that owns the
//! statement.

use std::time::Duration;

use kube::core::{GroupVersionKind, GroupVersionResource};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::filter::Filter;

/// Supported patch flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchType {
    #[default]
    Merge,
    Strategic,
}

/// The per-request context.
///
/// A statement becomes executable once its GVK has been resolved to a GVR;
/// dispatching with `gvr == None` fails fast with a resolution error.
#[derive(Clone, Default)]
pub struct Statement {
    pub gvk: Option<GroupVersionKind>,
    pub gvr: Option<GroupVersionResource>,
    /// Whether the resolved resource is namespace-scoped.
    pub namespaced: bool,
    /// Set by `namespace("*")`: list across every namespace.
    pub all_namespace: bool,
    pub namespace: Option<String>,
    /// Multi-namespace selection; non-empty only for `namespace(a, b, ...)`.
    pub namespace_list: Vec<String>,
    pub name: Option<String>,
    pub filter: Filter,
    /// When set, get/list results are served from and written to the
    /// cluster cache with this TTL.
    pub cache_ttl: Option<Duration>,
    /// End-to-end cancellation for this request only.
    pub cancel: CancellationToken,
    // Verb-specific extras.
    pub container: Option<String>,
    pub command: Vec<String>,
    pub tail_lines: Option<i64>,
    pub patch_type: PatchType,
    pub patch_body: Option<Value>,
    /// Payload for create/update.
    pub object: Option<Value>,
}

impl Statement {
    /// Human-readable resource coordinates for logs and errors.
    pub fn kind_display(&self) -> String {
        self.gvk
            .as_ref()
            .map(|g| g.kind.clone())
            .unwrap_or_else(|| "<unresolved>".to_string())
    }

    /// Whether a resource living in `ns` is selected by this statement's
    /// namespace scoping. Used for post-filtering multi-namespace lists.
    pub fn selects_namespace(&self, ns: &str) -> bool {
        if self.all_namespace {
            return true;
        }
        if !self.namespace_list.is_empty() {
            return self.namespace_list.iter().any(|n| n == ns);
        }
        match &self.namespace {
            Some(selected) => selected == ns,
            // No namespace given means "across all namespaces" for lists.
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_selection_precedence() {
        let mut stmt = Statement {
            namespace: Some("ns1".into()),
            ..Default::default()
        };
        assert!(stmt.selects_namespace("ns1"));
        assert!(!stmt.selects_namespace("ns2"));

        stmt.namespace_list = vec!["ns1".into(), "ns2".into()];
        assert!(stmt.selects_namespace("ns2"));
        assert!(!stmt.selects_namespace("ns3"));

        stmt.all_namespace = true;
        assert!(stmt.selects_namespace("anything"));
    }

    #[test]
    fn no_namespace_selects_everything() {
        let stmt = Statement::default();
        assert!(stmt.selects_namespace("any"));
    }

    #[test]
    fn clone_is_independent() {
        let mut a = Statement::default();
        a.namespace = Some("ns1".into());
        let mut b = a.clone();
        b.namespace = Some("ns2".into());
        b.filter.merge_label_selector("app=x");
        assert_eq!(a.namespace.as_deref(), Some("ns1"));
        assert!(a.filter.label_selector.is_none());
    }
}
