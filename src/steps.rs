// SPDX-License-Identifier: BSD-3-Clause

//! Default operation steps.
//!
//! Every verb chain is seeded with one `kubectl:<verb>` step that performs
//! the actual API call. Interceptors anchor around these names; tests and
//! embedders can `replace` them wholesale to run against fake backends.
//!
//! All steps honor the statement's cancellation token and communicate
//! results through the invocation's JSON output slot (or the event stream
//! for Watch).

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::JSONSchemaProps;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::core::GroupVersionKind;
use kube::runtime::{watcher, WatchStreamExt};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callback::{Callbacks, Invocation, StepFuture, StepHandler};
use crate::error::{Error, Result};
use crate::statement::{PatchType, Statement};

/// Page size for chunked list requests.
const PAGE_SIZE: u32 = 500;

/// Capacity of the channel a watch step hands back to the caller.
const WATCH_CHANNEL_CAPACITY: usize = 32;

macro_rules! step {
    ($f:path) => {
        Arc::new(|inv: Invocation| -> StepFuture { Box::pin($f(inv)) }) as StepHandler
    };
}

/// Seed every verb chain with its default operation step.
pub(crate) fn register_defaults(callbacks: &Callbacks) {
    callbacks.get().register("kubectl:get", step!(get_resource));
    callbacks.list().register("kubectl:list", step!(list_resources));
    callbacks.create().register("kubectl:create", step!(create_resource));
    callbacks.update().register("kubectl:update", step!(update_resource));
    callbacks.delete().register("kubectl:delete", step!(delete_resource));
    callbacks.patch().register("kubectl:patch", step!(patch_resource));
    callbacks.logs().register("kubectl:logs", step!(pod_logs));
    callbacks.exec().register("kubectl:exec", step!(pod_exec));
    callbacks.watch().register("kubectl:watch", step!(watch_resources));
    callbacks.describe().register("kubectl:describe", step!(describe_resource));
    callbacks.doc().register("kubectl:doc", step!(doc_resource));
}

/// Race an API call against the statement's cancellation token.
async fn race<T>(
    cancel: CancellationToken,
    fut: impl Future<Output = kube::Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::pipeline("request cancelled")),
        res = fut => res.map_err(Error::from),
    }
}

fn required_gvk(stmt: &Statement) -> Result<GroupVersionKind> {
    stmt.gvk
        .clone()
        .ok_or_else(|| Error::resolution("resource not resolved; call resource()/gvk()/table() first"))
}

fn api_resource(stmt: &Statement) -> Result<ApiResource> {
    let gvk = required_gvk(stmt)?;
    let plural = stmt
        .gvr
        .as_ref()
        .map(|g| g.resource.clone())
        .ok_or_else(|| Error::resolution("resource not resolved to a GVR"))?;
    Ok(ApiResource::from_gvk_with_plural(&gvk, &plural))
}

/// Api for single-object verbs: the statement's namespace, defaulting to
/// `default` for namespaced kinds.
fn object_api(inv: &Invocation) -> Result<Api<DynamicObject>> {
    let stmt = &inv.stmt;
    let ar = api_resource(stmt)?;
    let client = inv.cluster.client().clone();
    Ok(if stmt.namespaced {
        let ns = stmt.namespace.as_deref().unwrap_or("default");
        Api::namespaced_with(client, ns, &ar)
    } else {
        Api::all_with(client, &ar)
    })
}

/// Api for list/watch: namespace-scoped only when exactly one namespace is
/// selected; multi-namespace and all-namespace scans go through the
/// cluster-wide endpoint and are post-filtered.
fn collection_api(inv: &Invocation) -> Result<Api<DynamicObject>> {
    let stmt = &inv.stmt;
    let ar = api_resource(stmt)?;
    let client = inv.cluster.client().clone();
    let single_ns = stmt.namespaced
        && !stmt.all_namespace
        && stmt.namespace_list.is_empty()
        && stmt.namespace.is_some();
    Ok(if single_ns {
        Api::namespaced_with(client, stmt.namespace.as_deref().unwrap_or("default"), &ar)
    } else {
        Api::all_with(client, &ar)
    })
}

fn gvr_key(stmt: &Statement) -> String {
    match &stmt.gvr {
        Some(g) => format!("{}/{}/{}", g.group, g.version, g.resource),
        None => "<unresolved>".to_string(),
    }
}

/// Fill in apiVersion/kind on a serialized object; list items arrive from
/// the API server without them.
fn inject_type_meta(value: &mut Value, gvk: &GroupVersionKind) {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    if let Some(obj) = value.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert(Value::String(api_version));
        obj.entry("kind").or_insert(Value::String(gvk.kind.clone()));
    }
}

async fn get_resource(mut inv: Invocation) -> Result<Invocation> {
    let name = inv
        .stmt
        .name
        .clone()
        .ok_or_else(|| Error::resolution("get requires a resource name"))?;
    let cache_key = format!(
        "get:{}:{}:{}",
        gvr_key(&inv.stmt),
        inv.stmt.namespace.as_deref().unwrap_or(""),
        name
    );
    if inv.stmt.cache_ttl.is_some() {
        if let Some(hit) = inv.cluster.cache().get::<Value>(&cache_key).await {
            debug!(key = %cache_key, "get served from cache");
            inv.output = Some((*hit).clone());
            return Ok(inv);
        }
    }

    let api = object_api(&inv)?;
    let obj = match race(inv.stmt.cancel.clone(), api.get(&name)).await {
        Ok(obj) => obj,
        Err(e) if e.is_not_found() => {
            return Err(Error::not_found(inv.stmt.kind_display(), name));
        }
        Err(e) => return Err(e),
    };
    let mut value = serde_json::to_value(&obj)?;
    if let Some(gvk) = &inv.stmt.gvk {
        inject_type_meta(&mut value, gvk);
    }

    if let Some(ttl) = inv.stmt.cache_ttl {
        inv.cluster
            .cache()
            .insert_with_ttl(cache_key, value.clone(), Some(ttl))
            .await;
    }
    inv.output = Some(value);
    Ok(inv)
}

async fn list_resources(mut inv: Invocation) -> Result<Invocation> {
    let cache_key = format!(
        "list:{}:{}:{}:{}:{}",
        gvr_key(&inv.stmt),
        namespace_scope(&inv.stmt),
        inv.stmt.filter.label_selector.as_deref().unwrap_or(""),
        inv.stmt.filter.field_selector.as_deref().unwrap_or(""),
        inv.stmt.filter.sql,
    );
    if inv.stmt.cache_ttl.is_some() {
        if let Some(hit) = inv.cluster.cache().get::<Value>(&cache_key).await {
            debug!(key = %cache_key, "list served from cache");
            inv.output = Some((*hit).clone());
            return Ok(inv);
        }
    }

    let api = collection_api(&inv)?;
    let mut lp = ListParams::default().limit(PAGE_SIZE);
    if let Some(labels) = &inv.stmt.filter.label_selector {
        lp = lp.labels(labels);
    }
    if let Some(fields) = &inv.stmt.filter.field_selector {
        lp = lp.fields(fields);
    }

    // Chunked listing: follow the continue token until the server is done.
    let mut raw: Vec<DynamicObject> = Vec::new();
    let mut continue_token: Option<String> = None;
    loop {
        let page_params = match &continue_token {
            Some(token) => lp.clone().continue_token(token),
            None => lp.clone(),
        };
        let page = race(inv.stmt.cancel.clone(), api.list(&page_params)).await?;
        continue_token = page
            .metadata
            .continue_
            .clone()
            .filter(|t| !t.is_empty());
        raw.extend(page.items);
        if continue_token.is_none() {
            break;
        }
    }

    let gvk = required_gvk(&inv.stmt)?;
    let mut items: Vec<Value> = Vec::with_capacity(raw.len());
    for obj in raw {
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        if inv.stmt.namespaced && !inv.stmt.selects_namespace(&ns) {
            continue;
        }
        let mut value = serde_json::to_value(&obj)?;
        inject_type_meta(&mut value, &gvk);
        items.push(value);
    }
    let items = inv.stmt.filter.apply(items);
    let output = Value::Array(items);

    if let Some(ttl) = inv.stmt.cache_ttl {
        inv.cluster
            .cache()
            .insert_with_ttl(cache_key, output.clone(), Some(ttl))
            .await;
    }
    inv.output = Some(output);
    Ok(inv)
}

fn namespace_scope(stmt: &Statement) -> String {
    if stmt.all_namespace {
        "*".to_string()
    } else if !stmt.namespace_list.is_empty() {
        stmt.namespace_list.join(",")
    } else {
        stmt.namespace.clone().unwrap_or_default()
    }
}

async fn create_resource(mut inv: Invocation) -> Result<Invocation> {
    let mut payload = inv
        .stmt
        .object
        .clone()
        .ok_or_else(|| Error::resolution("create requires an object payload"))?;
    let gvk = required_gvk(&inv.stmt)?;
    inject_type_meta(&mut payload, &gvk);
    let obj: DynamicObject = serde_json::from_value(payload)?;

    let api = payload_api(&inv, &obj)?;
    let created = race(
        inv.stmt.cancel.clone(),
        api.create(&PostParams::default(), &obj),
    )
    .await?;
    inv.output = Some(serde_json::to_value(&created)?);
    Ok(inv)
}

async fn update_resource(mut inv: Invocation) -> Result<Invocation> {
    let mut payload = inv
        .stmt
        .object
        .clone()
        .ok_or_else(|| Error::resolution("update requires an object payload"))?;
    let gvk = required_gvk(&inv.stmt)?;
    inject_type_meta(&mut payload, &gvk);
    let obj: DynamicObject = serde_json::from_value(payload)?;
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::resolution("update requires metadata.name"))?;

    let api = payload_api(&inv, &obj)?;
    let updated = race(
        inv.stmt.cancel.clone(),
        api.replace(&name, &PostParams::default(), &obj),
    )
    .await?;
    inv.output = Some(serde_json::to_value(&updated)?);
    Ok(inv)
}

/// Api for payload-carrying verbs: the object's own namespace wins over the
/// statement's.
fn payload_api(inv: &Invocation, obj: &DynamicObject) -> Result<Api<DynamicObject>> {
    let stmt = &inv.stmt;
    let ar = api_resource(stmt)?;
    let client = inv.cluster.client().clone();
    Ok(if stmt.namespaced {
        let ns = obj
            .metadata
            .namespace
            .clone()
            .or_else(|| stmt.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        Api::namespaced_with(client, &ns, &ar)
    } else {
        Api::all_with(client, &ar)
    })
}

async fn delete_resource(mut inv: Invocation) -> Result<Invocation> {
    let name = inv
        .stmt
        .name
        .clone()
        .ok_or_else(|| Error::resolution("delete requires a resource name"))?;
    let api = object_api(&inv)?;
    let res = race(
        inv.stmt.cancel.clone(),
        api.delete(&name, &DeleteParams::default()),
    )
    .await?;
    let value = res.either(
        |obj| serde_json::to_value(&obj),
        |status| serde_json::to_value(&status),
    )?;
    inv.output = Some(value);
    Ok(inv)
}

async fn patch_resource(mut inv: Invocation) -> Result<Invocation> {
    let name = inv
        .stmt
        .name
        .clone()
        .ok_or_else(|| Error::resolution("patch requires a resource name"))?;
    let body = inv
        .stmt
        .patch_body
        .clone()
        .ok_or_else(|| Error::resolution("patch requires a patch body"))?;
    let api = object_api(&inv)?;
    let patched = match inv.stmt.patch_type {
        PatchType::Merge => {
            race(
                inv.stmt.cancel.clone(),
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&body)),
            )
            .await?
        }
        PatchType::Strategic => {
            race(
                inv.stmt.cancel.clone(),
                api.patch(&name, &PatchParams::default(), &Patch::Strategic(&body)),
            )
            .await?
        }
    };
    inv.output = Some(serde_json::to_value(&patched)?);
    Ok(inv)
}

async fn pod_logs(mut inv: Invocation) -> Result<Invocation> {
    let name = inv
        .stmt
        .name
        .clone()
        .ok_or_else(|| Error::resolution("logs requires a pod name"))?;
    let ns = inv
        .stmt
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let mut path = format!("/api/v1/namespaces/{ns}/pods/{name}/log");
    let mut query: Vec<String> = Vec::new();
    if let Some(container) = &inv.stmt.container {
        query.push(format!("container={container}"));
    }
    if let Some(tail) = inv.stmt.tail_lines {
        query.push(format!("tailLines={tail}"));
    }
    if !query.is_empty() {
        path.push('?');
        path.push_str(&query.join("&"));
    }
    let request = http::Request::get(path)
        .body(Vec::new())
        .map_err(|e| Error::pipeline(format!("building log request: {e}")))?;
    let text = race(
        inv.stmt.cancel.clone(),
        inv.cluster.client().request_text(request),
    )
    .await?;
    inv.output = Some(Value::String(text));
    Ok(inv)
}

async fn pod_exec(mut inv: Invocation) -> Result<Invocation> {
    let name = inv
        .stmt
        .name
        .clone()
        .ok_or_else(|| Error::resolution("exec requires a pod name"))?;
    if inv.stmt.command.is_empty() {
        return Err(Error::resolution("exec requires a command"));
    }
    let ns = inv
        .stmt
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let api: Api<Pod> = Api::namespaced(inv.cluster.client().clone(), &ns);
    let mut ap = AttachParams::default().stdin(false).stdout(true).stderr(false);
    if let Some(container) = &inv.stmt.container {
        ap = ap.container(container);
    }
    let mut attached = race(
        inv.stmt.cancel.clone(),
        api.exec(&name, inv.stmt.command.clone(), &ap),
    )
    .await?;
    let mut stdout = attached
        .stdout()
        .ok_or_else(|| Error::pipeline("exec produced no stdout stream"))?;
    let mut buf = String::new();
    stdout
        .read_to_string(&mut buf)
        .await
        .map_err(|e| Error::pipeline(format!("reading exec output: {e}")))?;
    inv.output = Some(Value::String(buf));
    Ok(inv)
}

async fn watch_resources(mut inv: Invocation) -> Result<Invocation> {
    let api = collection_api(&inv)?;
    let mut cfg = watcher::Config::default();
    if let Some(labels) = &inv.stmt.filter.label_selector {
        cfg = cfg.labels(labels);
    }
    if let Some(fields) = &inv.stmt.filter.field_selector {
        cfg = cfg.fields(fields);
    }

    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let cancel = inv.stmt.cancel.clone();
    let kind = inv.stmt.kind_display();
    // default_backoff keeps a persistently failing stream from being
    // re-polled in a tight loop.
    let mut stream = watcher(api, cfg).default_backoff().boxed();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "watch stream error"),
                    None => return,
                },
            }
        }
    });
    inv.stream = Some(rx);
    Ok(inv)
}

async fn describe_resource(inv: Invocation) -> Result<Invocation> {
    let mut inv = get_resource(inv).await?;
    let text = inv
        .output
        .as_ref()
        .map(render_describe)
        .ok_or_else(|| Error::pipeline("describe found no object to render"))?;
    inv.output = Some(Value::String(text));
    Ok(inv)
}

fn render_describe(value: &Value) -> String {
    let mut out = String::new();
    let field = |path: &str| -> String {
        crate::filter::lookup_path(value, path)
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "<none>".to_string())
    };
    out.push_str(&format!("Name:         {}\n", field("metadata.name")));
    out.push_str(&format!("Namespace:    {}\n", field("metadata.namespace")));
    out.push_str(&format!("Kind:         {}\n", field("kind")));
    out.push_str(&format!("API Version:  {}\n", field("apiVersion")));
    out.push_str(&format!("Created:      {}\n", field("metadata.creationTimestamp")));
    for (label, path) in [("Labels", "metadata.labels"), ("Annotations", "metadata.annotations")] {
        match crate::filter::lookup_path(value, path).and_then(|v| v.as_object()) {
            Some(map) if !map.is_empty() => {
                out.push_str(&format!("{label}:\n"));
                for (k, v) in map {
                    out.push_str(&format!("  {k}={}\n", v.as_str().unwrap_or_default()));
                }
            }
            _ => out.push_str(&format!("{label}:      <none>\n")),
        }
    }
    if let Some(phase) = crate::filter::lookup_path(value, "status.phase") {
        out.push_str(&format!("Status:       {}\n", phase.as_str().unwrap_or_default()));
    }
    out
}

async fn doc_resource(mut inv: Invocation) -> Result<Invocation> {
    let gvk = required_gvk(&inv.stmt)?;
    let resolver = inv.cluster.resolver();
    let text = if resolver.is_builtin_resource_by_gvk(&gvk) {
        let api_version = if gvk.group.is_empty() {
            gvk.version.clone()
        } else {
            format!("{}/{}", gvk.group, gvk.version)
        };
        format!(
            "Kind: {}\nApiVersion: {}\nBuilt-in resource; see the Kubernetes API reference.\n",
            gvk.kind, api_version
        )
    } else {
        let crd = resolver.crd(&gvk.kind, &gvk.group)?;
        let version = crd
            .spec
            .versions
            .iter()
            .find(|v| v.name == gvk.version)
            .or_else(|| crd.spec.versions.iter().find(|v| v.served && v.storage))
            .ok_or_else(|| {
                Error::resolution(format!("no documented version for {}", gvk.kind))
            })?;
        let mut out = format!(
            "Kind: {}\nApiVersion: {}/{}\n",
            gvk.kind, gvk.group, version.name
        );
        if let Some(schema) = version.schema.as_ref().and_then(|s| s.open_api_v3_schema.as_ref()) {
            out.push_str("Fields:\n");
            render_schema(schema, "", 0, &mut out);
        }
        out
    };
    inv.output = Some(Value::String(text));
    Ok(inv)
}

/// Flatten an OpenAPI v3 schema into indented `name (type): description`
/// lines, depth-limited so recursive schemas cannot loop.
fn render_schema(schema: &JSONSchemaProps, _path: &str, depth: usize, out: &mut String) {
    if depth > 8 {
        return;
    }
    let Some(properties) = &schema.properties else {
        return;
    };
    for (name, prop) in properties {
        let indent = "  ".repeat(depth + 1);
        let type_ = prop.type_.as_deref().unwrap_or("object");
        match &prop.description {
            Some(desc) => {
                let first_line = desc.lines().next().unwrap_or_default();
                out.push_str(&format!("{indent}{name} ({type_}): {first_line}\n"));
            }
            None => out.push_str(&format!("{indent}{name} ({type_})\n")),
        }
        render_schema(prop, name, depth + 1, out);
    }
}
