// SPDX-License-Identifier: BSD-3-Clause

//! End-to-end pipeline tests against a fake-backed cluster: fluent chains,
//! SQL queries, the applier, metadata editing and registry lifecycle.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Value};

use common::{fake_cluster, pod};
use kubeq::{Error, Invocation, Kubectl, StepFuture, StepHandler};

#[tokio::test]
async fn sql_list_filters_scope_and_labels() {
    let (_registry, cluster, store) = fake_cluster("sql");
    store.seed("pods", "ns1", "web-0", pod("web-0", "ns1", json!({"app": "web"}), "Running"));
    store.seed("pods", "ns1", "web-1", pod("web-1", "ns1", json!({"app": "web"}), "Pending"));
    store.seed("pods", "ns1", "db-0", pod("db-0", "ns1", json!({"app": "db"}), "Running"));
    store.seed("pods", "ns2", "web-9", pod("web-9", "ns2", json!({"app": "web"}), "Running"));

    let handle = Kubectl::new(cluster);
    let pods: Vec<Pod> = handle
        .sql("select * from pods where metadata.namespace='ns1' and labels.app='web' order by metadata.name")
        .list()
        .await
        .unwrap();
    let names: Vec<_> = pods
        .iter()
        .map(|p| p.metadata.name.clone().unwrap())
        .collect();
    assert_eq!(names, vec!["web-0", "web-1"]);
}

#[tokio::test]
async fn fluent_chain_matches_equivalent_sql() {
    let (_registry, cluster, store) = fake_cluster("fluent");
    store.seed("pods", "ns1", "web-0", pod("web-0", "ns1", json!({"app": "web"}), "Running"));
    store.seed("pods", "ns1", "web-1", pod("web-1", "ns1", json!({"app": "web"}), "Pending"));

    let handle = Kubectl::new(cluster);
    let by_fluent: Vec<Value> = handle
        .resource::<Pod>()
        .namespace("ns1")
        .where_clause("status.phase='Running'")
        .list()
        .await
        .unwrap();
    let by_sql: Vec<Value> = handle
        .sql("select * from pods where metadata.namespace='ns1' and status.phase='Running'")
        .list()
        .await
        .unwrap();
    assert_eq!(by_fluent.len(), 1);
    assert_eq!(by_fluent, by_sql);
}

#[tokio::test]
async fn multi_namespace_selection_post_filters() {
    let (_registry, cluster, store) = fake_cluster("multi-ns");
    for ns in ["ns1", "ns2", "ns3"] {
        store.seed("pods", ns, "p", pod("p", ns, json!({}), "Running"));
    }

    let handle = Kubectl::new(cluster);
    let pods: Vec<Value> = handle
        .resource::<Pod>()
        .namespaces(["ns1", "ns3"])
        .list()
        .await
        .unwrap();
    let mut namespaces: Vec<_> = pods
        .iter()
        .map(|p| p["metadata"]["namespace"].as_str().unwrap().to_string())
        .collect();
    namespaces.sort();
    assert_eq!(namespaces, vec!["ns1", "ns3"]);
}

#[tokio::test]
async fn get_missing_object_is_not_found() {
    let (_registry, cluster, _store) = fake_cluster("not-found");
    let err = Kubectl::new(cluster)
        .resource::<Pod>()
        .namespace("ns1")
        .name("ghost")
        .get::<Pod>()
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn applier_create_update_delete_lifecycle() {
    let (_registry, cluster, store) = fake_cluster("applier");
    let applier_cluster = cluster.clone();
    let applier = Kubectl::new(cluster).applier();
    let yaml = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: ns1
data:
  mode: fast
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: flags
  namespace: ns1
data:
  beta: \"true\"
";

    let results = applier.apply(yaml).await;
    assert_eq!(
        results,
        vec!["ConfigMap/settings created", "ConfigMap/flags created"]
    );
    assert_eq!(store.len(), 2);

    // Second apply finds both and replaces them.
    let results = applier.apply(yaml).await;
    assert_eq!(
        results,
        vec!["ConfigMap/settings updated", "ConfigMap/flags updated"]
    );

    let results = applier.delete(yaml).await;
    assert_eq!(
        results,
        vec!["ConfigMap/settings deleted", "ConfigMap/flags deleted"]
    );
    assert_eq!(store.len(), 0);

    let results = applier.delete(yaml).await;
    assert_eq!(
        results,
        vec!["ConfigMap/settings not found", "ConfigMap/flags not found"]
    );

    // A deleted object no longer gets, and the failure stays classifiable.
    let err = Kubectl::new(applier_cluster)
        .table("configmaps")
        .namespace("ns1")
        .name("settings")
        .get::<Value>()
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn label_edits_merge_and_remove() {
    let (_registry, cluster, store) = fake_cluster("labels");
    store.seed(
        "pods",
        "ns1",
        "web-0",
        pod("web-0", "ns1", json!({"app": "web", "deprecated": "true"}), "Running"),
    );

    Kubectl::new(cluster)
        .resource::<Pod>()
        .namespace("ns1")
        .name("web-0")
        .ctl()
        .label(&["team=infra", "deprecated-"])
        .await
        .unwrap();

    let labels = store.get("pods", "ns1", "web-0").unwrap()["metadata"]["labels"].clone();
    assert_eq!(labels["app"], "web");
    assert_eq!(labels["team"], "infra");
    assert!(labels.get("deprecated").is_none());
}

#[tokio::test]
async fn malformed_label_entry_fails_before_patching() {
    let (_registry, cluster, store) = fake_cluster("labels-bad");
    store.seed("pods", "ns1", "web-0", pod("web-0", "ns1", json!({"app": "web"}), "Running"));

    let err = Kubectl::new(cluster)
        .resource::<Pod>()
        .namespace("ns1")
        .name("web-0")
        .ctl()
        .label(&["not a label"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Syntax(_)));
    // The object is untouched.
    let labels = store.get("pods", "ns1", "web-0").unwrap()["metadata"]["labels"].clone();
    assert_eq!(labels, json!({"app": "web"}));
}

#[tokio::test]
async fn interceptors_wrap_the_default_step() {
    let (_registry, cluster, store) = fake_cluster("interceptor");
    store.seed("pods", "ns1", "web-0", pod("web-0", "ns1", json!({}), "Running"));

    let before = Arc::new(AtomicUsize::new(0));
    let after = Arc::new(AtomicBool::new(false));
    let counter = before.clone();
    cluster.callbacks().list().before("kubectl:list").register(
        "audit:count",
        Arc::new(move |inv: Invocation| -> StepFuture {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(inv)
            })
        }) as StepHandler,
    );
    let seen = after.clone();
    cluster.callbacks().list().after("kubectl:list").register(
        "audit:saw-output",
        Arc::new(move |inv: Invocation| -> StepFuture {
            let seen = seen.clone();
            Box::pin(async move {
                seen.store(inv.output.is_some(), Ordering::SeqCst);
                Ok(inv)
            })
        }) as StepHandler,
    );

    let handle = Kubectl::new(cluster);
    let pods: Vec<Value> = handle.resource::<Pod>().namespace("ns1").list().await.unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(before.load(Ordering::SeqCst), 1);
    assert!(after.load(Ordering::SeqCst));
}

#[tokio::test]
async fn registry_reuses_instances_and_tears_down_on_remove() {
    let (registry, cluster, _store) = fake_cluster("lifecycle");
    let again = registry
        .register_by_client_with_id(
            "lifecycle",
            common::mock_client(),
            kubeq::RegisterOptions::new(),
        )
        .unwrap();
    assert!(Arc::ptr_eq(&cluster, &again));

    let torn_down = Arc::new(AtomicBool::new(false));
    let flag = torn_down.clone();
    cluster.push_teardown(Box::new(move || flag.store(true, Ordering::SeqCst)));

    registry.remove("lifecycle");
    assert!(torn_down.load(Ordering::SeqCst));
    assert!(registry.get("lifecycle").is_none());
    registry.remove("lifecycle");
}
