// SPDX-License-Identifier: BSD-3-Clause

//! The fluent query handle.
//!
//! A [`Kubectl`] is a cheap value: every fluent call clones the handle and
//! returns a new one (copy-on-branch), so one resolved handle can fan out
//! into many independent queries. Errors raised mid-chain (an unknown
//! table, a malformed condition) stick to the branch and surface at the
//! terminal verb; later fluent calls on a poisoned branch are no-ops.

use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::runtime::watcher;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::applier::Applier;
use crate::callback::{Callbacks, Invocation, Verb};
use crate::cluster::ClusterInst;
use crate::ctl::Ctl;
use crate::error::{Error, Result};
use crate::filter::{Condition, Operator};
use crate::sql::{parse_conditions, parse_select};
use crate::statement::{PatchType, Statement};

/// Fluent, branchable query handle bound to one cluster.
#[derive(Clone)]
pub struct Kubectl {
    cluster: Arc<ClusterInst>,
    stmt: Statement,
    err: Option<Error>,
}

impl Kubectl {
    pub fn new(cluster: Arc<ClusterInst>) -> Self {
        Self {
            cluster,
            stmt: Statement::default(),
            err: None,
        }
    }

    /// Clone-and-mutate helper behind every fluent call. A poisoned branch
    /// is cloned untouched so the first error survives to the terminal.
    fn branch(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        if next.err.is_none() {
            f(&mut next);
        }
        next
    }

    fn poison(&self, err: Error) -> Self {
        let mut next = self.clone();
        if next.err.is_none() {
            next.err = Some(err);
        }
        next
    }

    /// Select a compiled-in resource type.
    pub fn resource<K>(&self) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let gvk = GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()));
        self.gvk(&gvk.group, &gvk.version, &gvk.kind)
    }

    /// Select a resource by group/version/kind, resolving scope and plural
    /// against the cluster.
    pub fn gvk(&self, group: &str, version: &str, kind: &str) -> Self {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        match self.cluster.resolver().resolve_gvk(&gvk) {
            Ok(resolved) => self.branch(|k| {
                k.stmt.gvk = Some(resolved.gvk);
                k.stmt.gvr = Some(resolved.gvr);
                k.stmt.namespaced = resolved.namespaced;
            }),
            Err(e) => self.poison(e),
        }
    }

    /// Select a resource by table name: plural, singular, short name or
    /// kind, custom resources included.
    pub fn table(&self, name: &str) -> Self {
        match self.cluster.resolver().resolve_table_name(name) {
            Ok(resolved) => self.branch(|k| {
                k.stmt.gvk = Some(resolved.gvk);
                k.stmt.gvr = Some(resolved.gvr);
                k.stmt.namespaced = resolved.namespaced;
            }),
            Err(e) => self.poison(e),
        }
    }

    /// Scope to one namespace; `"*"` selects every namespace.
    pub fn namespace(&self, ns: impl Into<String>) -> Self {
        let ns = ns.into();
        self.branch(|k| {
            if ns == "*" {
                k.stmt.all_namespace = true;
                k.stmt.namespace = None;
                k.stmt.namespace_list.clear();
            } else {
                k.stmt.all_namespace = false;
                k.stmt.namespace = Some(ns);
                k.stmt.namespace_list.clear();
            }
        })
    }

    /// Scope to several namespaces at once. The selection is recorded in
    /// the diagnostic SQL fragment and enforced by post-filtering, since
    /// the API has no multi-namespace endpoint.
    pub fn namespaces<I, S>(&self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list: Vec<String> = namespaces.into_iter().map(Into::into).collect();
        self.branch(|k| {
            let fragment = list
                .iter()
                .map(|ns| format!("metadata.namespace='{ns}'"))
                .collect::<Vec<_>>()
                .join(" or ");
            if !fragment.is_empty() {
                k.stmt.filter.append_sql(&fragment);
            }
            k.stmt.all_namespace = false;
            k.stmt.namespace = None;
            k.stmt.namespace_list = list;
        })
    }

    pub fn name(&self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.branch(|k| k.stmt.name = Some(name))
    }

    /// Add `WHERE`-style conditions from a SQL fragment, e.g.
    /// `status.phase='Running' and labels.app='web'`.
    pub fn where_clause(&self, fragment: &str) -> Self {
        match parse_conditions(fragment) {
            Ok(conditions) => self.branch(|k| {
                for cond in conditions {
                    k.apply_condition(cond);
                }
            }),
            Err(e) => self.poison(e),
        }
    }

    pub fn limit(&self, limit: u64) -> Self {
        self.branch(|k| k.stmt.filter.limit = Some(limit))
    }

    pub fn offset(&self, offset: u64) -> Self {
        self.branch(|k| k.stmt.filter.offset = Some(offset))
    }

    /// Order expression, e.g. `metadata.creationTimestamp desc`.
    pub fn order_by(&self, order: impl Into<String>) -> Self {
        let order = order.into();
        self.branch(|k| k.stmt.filter.order = Some(order))
    }

    /// Merge a label selector fragment, pushed down to the API server.
    pub fn with_label_selector(&self, selector: &str) -> Self {
        let selector = selector.to_string();
        self.branch(|k| k.stmt.filter.merge_label_selector(&selector))
    }

    /// Merge a field selector fragment, pushed down to the API server.
    pub fn with_field_selector(&self, selector: &str) -> Self {
        let selector = selector.to_string();
        self.branch(|k| k.stmt.filter.merge_field_selector(&selector))
    }

    /// Serve get/list from the cluster cache with this TTL.
    pub fn with_cache(&self, ttl: Duration) -> Self {
        self.branch(|k| k.stmt.cache_ttl = Some(ttl))
    }

    /// Attach a cancellation token covering this request end to end.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        self.branch(|k| k.stmt.cancel = cancel)
    }

    pub fn patch_type(&self, patch_type: PatchType) -> Self {
        self.branch(|k| k.stmt.patch_type = patch_type)
    }

    pub fn container(&self, container: impl Into<String>) -> Self {
        let container = container.into();
        self.branch(|k| k.stmt.container = Some(container))
    }

    pub fn tail_lines(&self, lines: i64) -> Self {
        self.branch(|k| k.stmt.tail_lines = Some(lines))
    }

    /// Compile a full `select * from <table> ...` statement onto this
    /// branch: table resolution, conditions, ordering and limit.
    pub fn sql(&self, query: &str) -> Self {
        let parsed = match parse_select(query) {
            Ok(p) => p,
            Err(e) => return self.poison(e),
        };
        let mut next = self.table(&parsed.table);
        if next.err.is_some() {
            return next;
        }
        next = next.branch(|k| {
            for cond in parsed.conditions {
                k.apply_condition(cond);
            }
            if let Some(order) = parsed.order {
                k.stmt.filter.order = Some(order);
            }
            if let Some(limit) = parsed.limit {
                k.stmt.filter.limit = Some(limit);
            }
        });
        debug!(cluster = %self.cluster.id(), sql = %next.stmt.filter.sql, "compiled sql query");
        next
    }

    /// Fold one condition into the statement. Name and namespace equality
    /// narrow the request scope, label equality is additionally pushed down
    /// as a selector; every condition stays in the post-filter set.
    fn apply_condition(&mut self, cond: Condition) {
        if cond.operator == Operator::Eq {
            if cond.field == "metadata.name" {
                if let Value::String(name) = &cond.value {
                    self.stmt.name = Some(name.clone());
                }
            }
            if cond.field == "metadata.namespace" {
                if let Value::String(ns) = &cond.value {
                    self.stmt.all_namespace = false;
                    self.stmt.namespace = Some(ns.clone());
                    self.stmt.namespace_list.clear();
                }
            }
        }
        if cond.operator == Operator::Eq {
            if let (Some(key), Value::String(v)) = (cond.field.strip_prefix("labels."), &cond.value)
            {
                self.stmt.filter.merge_label_selector(&format!("{key}={v}"));
            }
        }
        self.stmt.filter.push_condition(cond);
    }

    pub fn statement(&self) -> &Statement {
        &self.stmt
    }

    /// The branch's sticky error, if any fluent call failed.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn cluster_id(&self) -> &str {
        self.cluster.id()
    }

    pub fn cluster(&self) -> &Arc<ClusterInst> {
        &self.cluster
    }

    /// The callback chains of the bound cluster, for registering
    /// interceptors.
    pub fn callbacks(&self) -> &Callbacks {
        self.cluster.callbacks()
    }

    /// Label and annotation helpers over this branch.
    pub fn ctl(&self) -> Ctl {
        Ctl::new(self.clone())
    }

    /// YAML apply/delete helpers over this cluster.
    pub fn applier(&self) -> Applier {
        Applier::new(self.cluster.clone())
    }

    /// Run the verb chain for this branch.
    async fn dispatch(&self, verb: Verb) -> Result<Invocation> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.stmt.gvr.is_none() {
            return Err(Error::resolution(
                "no resource selected; call resource()/gvk()/table()/sql() first",
            ));
        }
        self.cluster.ensure_token().await?;
        let inv = Invocation::new(self.cluster.clone(), self.stmt.clone());
        self.cluster.callbacks().processor(verb).execute(inv).await
    }

    fn take_output(inv: Invocation) -> Result<Value> {
        inv.output
            .ok_or_else(|| Error::pipeline("chain produced no output"))
    }

    /// Fetch one object, deserialized into `K`.
    pub async fn get<K: DeserializeOwned>(&self) -> Result<K> {
        let inv = self.dispatch(Verb::Get).await?;
        Ok(serde_json::from_value(Self::take_output(inv)?)?)
    }

    /// List objects matching this branch's scope and filter.
    pub async fn list<K: DeserializeOwned>(&self) -> Result<Vec<K>> {
        let inv = self.dispatch(Verb::List).await?;
        Ok(serde_json::from_value(Self::take_output(inv)?)?)
    }

    /// Create `obj` and return the server's view of it.
    pub async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Serialize + DeserializeOwned,
    {
        let mut branch = self.clone();
        if branch.err.is_none() {
            branch.stmt.object = Some(serde_json::to_value(obj)?);
        }
        let inv = branch.dispatch(Verb::Create).await?;
        Ok(serde_json::from_value(Self::take_output(inv)?)?)
    }

    /// Replace `obj` and return the server's view of it.
    pub async fn update<K>(&self, obj: &K) -> Result<K>
    where
        K: Serialize + DeserializeOwned,
    {
        let mut branch = self.clone();
        if branch.err.is_none() {
            branch.stmt.object = Some(serde_json::to_value(obj)?);
        }
        let inv = branch.dispatch(Verb::Update).await?;
        Ok(serde_json::from_value(Self::take_output(inv)?)?)
    }

    /// Delete the named object.
    pub async fn delete(&self) -> Result<Value> {
        let inv = self.dispatch(Verb::Delete).await?;
        Self::take_output(inv)
    }

    /// Patch the named object with `body`, using the branch's patch type.
    pub async fn patch(&self, body: Value) -> Result<Value> {
        let mut branch = self.clone();
        if branch.err.is_none() {
            branch.stmt.patch_body = Some(body);
        }
        let inv = branch.dispatch(Verb::Patch).await?;
        Self::take_output(inv)
    }

    /// Fetch pod logs as text.
    pub async fn logs(&self) -> Result<String> {
        let inv = self.dispatch(Verb::Logs).await?;
        into_text(Self::take_output(inv)?)
    }

    /// Run `command` in the pod and return its stdout.
    pub async fn exec<I, S>(&self, command: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        let mut branch = self.clone();
        if branch.err.is_none() {
            branch.stmt.command = command;
        }
        let inv = branch.dispatch(Verb::Exec).await?;
        into_text(Self::take_output(inv)?)
    }

    /// Start a watch and return its event stream. The stream ends when the
    /// branch's cancellation token fires or the receiver is dropped.
    pub async fn watch(&self) -> Result<mpsc::Receiver<watcher::Event<DynamicObject>>> {
        let inv = self.dispatch(Verb::Watch).await?;
        inv.stream
            .ok_or_else(|| Error::pipeline("watch chain produced no stream"))
    }

    /// Text summary of the named object.
    pub async fn describe(&self) -> Result<String> {
        let inv = self.dispatch(Verb::Describe).await?;
        into_text(Self::take_output(inv)?)
    }

    /// Field documentation for the selected kind.
    pub async fn doc(&self) -> Result<String> {
        let inv = self.dispatch(Verb::Doc).await?;
        into_text(Self::take_output(inv)?)
    }
}

fn into_text(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(Error::pipeline(format!(
            "expected text output, got {other}"
        ))),
    }
}
