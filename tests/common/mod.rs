// SPDX-License-Identifier: BSD-3-Clause

//! Shared test fixtures: a cluster whose default operation steps are
//! replaced with handlers over an in-memory store, so the full pipeline
//! (resolution, fluent chains, SQL, applier) runs without an API server.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use dashmap::DashMap;
use http::{Request, Response};
use kube::client::Body;
use kube::Client;
use serde_json::{json, Value};
use tower_test::mock;

use kubeq::{
    ClusterInst, ClusterRegistry, Error, Invocation, RegisterOptions, Statement, StepFuture,
    StepHandler,
};

/// Route pipeline log output through the test harness. Filter with
/// `RUST_LOG`, e.g. `RUST_LOG=kubeq=debug`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A client whose transport is never driven; every real request fails.
/// Fine here: the fake steps never touch it.
pub fn mock_client() -> Client {
    let (svc, handle) = mock::pair::<Request<Body>, Response<Body>>();
    drop(handle);
    Client::new(svc, "default")
}

/// (plural, namespace, name) -> object. Cluster-scoped kinds use an empty
/// namespace component.
type Key = (String, String, String);

#[derive(Clone, Default)]
pub struct FakeStore {
    items: Arc<DashMap<Key, Value>>,
}

impl FakeStore {
    pub fn seed(&self, plural: &str, ns: &str, name: &str, value: Value) {
        self.items
            .insert((plural.into(), ns.into(), name.into()), value);
    }

    pub fn get(&self, plural: &str, ns: &str, name: &str) -> Option<Value> {
        self.items
            .get(&(plural.into(), ns.into(), name.into()))
            .map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// A pod object as the API server would serialize it.
pub fn pod(name: &str, ns: &str, labels: Value, phase: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "labels": labels},
        "status": {"phase": phase}
    })
}

/// Register a fake-backed cluster in a fresh registry and swap the default
/// operation steps for store-backed ones.
pub fn fake_cluster(id: &str) -> (ClusterRegistry, Arc<ClusterInst>, FakeStore) {
    init_tracing();
    let registry = ClusterRegistry::new();
    let cluster = registry
        .register_by_client_with_id(id, mock_client(), RegisterOptions::new().disable_crd_watch())
        .expect("fake registration");
    let store = FakeStore::default();
    install_fake_steps(&cluster, &store);
    (registry, cluster, store)
}

pub fn install_fake_steps(cluster: &Arc<ClusterInst>, store: &FakeStore) {
    let cb = cluster.callbacks();
    cb.get().replace("kubectl:get", fake_get(store.clone()));
    cb.list().replace("kubectl:list", fake_list(store.clone()));
    cb.create().replace("kubectl:create", fake_create(store.clone()));
    cb.update().replace("kubectl:update", fake_update(store.clone()));
    cb.delete().replace("kubectl:delete", fake_delete(store.clone()));
    cb.patch().replace("kubectl:patch", fake_patch(store.clone()));
}

fn plural(stmt: &Statement) -> String {
    stmt.gvr.as_ref().expect("resolved statement").resource.clone()
}

fn object_namespace(stmt: &Statement) -> String {
    if stmt.namespaced {
        stmt.namespace.clone().unwrap_or_else(|| "default".into())
    } else {
        String::new()
    }
}

fn required_name(stmt: &Statement) -> Result<String, Error> {
    stmt.name
        .clone()
        .ok_or_else(|| Error::resolution("a resource name is required"))
}

fn fake_get(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let name = required_name(&inv.stmt)?;
            let key = (plural(&inv.stmt), object_namespace(&inv.stmt), name.clone());
            match store.items.get(&key) {
                Some(value) => {
                    inv.output = Some(value.clone());
                    Ok(inv)
                }
                None => Err(Error::not_found(inv.stmt.kind_display(), name)),
            }
        })
    })
}

fn fake_list(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let plural = plural(&inv.stmt);
            let items: Vec<Value> = store
                .items
                .iter()
                .filter(|entry| {
                    let (p, ns, _) = entry.key();
                    *p == plural && (!inv.stmt.namespaced || inv.stmt.selects_namespace(ns))
                })
                .map(|entry| entry.value().clone())
                .collect();
            let items = inv.stmt.filter.apply(items);
            inv.output = Some(Value::Array(items));
            Ok(inv)
        })
    })
}

fn fake_create(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let object = inv
                .stmt
                .object
                .clone()
                .ok_or_else(|| Error::resolution("create requires an object"))?;
            let name = object["metadata"]["name"]
                .as_str()
                .ok_or_else(|| Error::resolution("create requires metadata.name"))?
                .to_string();
            let ns = object["metadata"]["namespace"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| object_namespace(&inv.stmt));
            store
                .items
                .insert((plural(&inv.stmt), ns, name), object.clone());
            inv.output = Some(object);
            Ok(inv)
        })
    })
}

fn fake_update(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let object = inv
                .stmt
                .object
                .clone()
                .ok_or_else(|| Error::resolution("update requires an object"))?;
            let name = object["metadata"]["name"]
                .as_str()
                .ok_or_else(|| Error::resolution("update requires metadata.name"))?
                .to_string();
            let ns = object["metadata"]["namespace"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| object_namespace(&inv.stmt));
            let key = (plural(&inv.stmt), ns, name.clone());
            if !store.items.contains_key(&key) {
                return Err(Error::not_found(inv.stmt.kind_display(), name));
            }
            store.items.insert(key, object.clone());
            inv.output = Some(object);
            Ok(inv)
        })
    })
}

fn fake_delete(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let name = required_name(&inv.stmt)?;
            let key = (plural(&inv.stmt), object_namespace(&inv.stmt), name.clone());
            match store.items.remove(&key) {
                Some((_, value)) => {
                    inv.output = Some(value);
                    Ok(inv)
                }
                None => Err(Error::not_found(inv.stmt.kind_display(), name)),
            }
        })
    })
}

fn fake_patch(store: FakeStore) -> StepHandler {
    Arc::new(move |mut inv: Invocation| -> StepFuture {
        let store = store.clone();
        Box::pin(async move {
            let name = required_name(&inv.stmt)?;
            let body = inv
                .stmt
                .patch_body
                .clone()
                .ok_or_else(|| Error::resolution("patch requires a body"))?;
            let key = (plural(&inv.stmt), object_namespace(&inv.stmt), name.clone());
            let mut entry = store
                .items
                .get_mut(&key)
                .ok_or_else(|| Error::not_found(inv.stmt.kind_display(), name))?;
            merge_patch(entry.value_mut(), &body);
            inv.output = Some(entry.value().clone());
            Ok(inv)
        })
    })
}

/// RFC 7386 merge patch: objects merge recursively, null removes, anything
/// else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let target_map = target.as_object_mut().expect("object target");
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(
                        target_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        other => *target = other.clone(),
    }
}
