// SPDX-License-Identifier: BSD-3-Clause

//! Declarative apply and delete over multi-document YAML.
//!
//! Each document is handled independently and yields one human-readable
//! result line; a bad document never aborts the rest of the batch.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::cluster::ClusterInst;
use crate::kubectl::Kubectl;

/// Batch apply/delete over one cluster.
pub struct Applier {
    cluster: Arc<ClusterInst>,
}

/// One YAML document's resource coordinates.
struct DocRef {
    kind: String,
    name: String,
    handle: Kubectl,
    value: Value,
}

impl Applier {
    pub(crate) fn new(cluster: Arc<ClusterInst>) -> Self {
        Self { cluster }
    }

    /// Create or update every document in `yaml`, returning one result
    /// line per document.
    pub async fn apply(&self, yaml: &str) -> Vec<String> {
        let mut results = Vec::new();
        for (index, doc) in parse_documents(yaml).into_iter().enumerate() {
            let doc = match doc {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(msg) => {
                    results.push(format!("document {index}: {msg}"));
                    continue;
                }
            };
            let doc = match self.resolve(doc, index) {
                Ok(doc) => doc,
                Err(msg) => {
                    results.push(msg);
                    continue;
                }
            };
            results.push(self.apply_one(doc).await);
        }
        results
    }

    /// Delete every document in `yaml`, returning one result line per
    /// document.
    pub async fn delete(&self, yaml: &str) -> Vec<String> {
        let mut results = Vec::new();
        for (index, doc) in parse_documents(yaml).into_iter().enumerate() {
            let doc = match doc {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(msg) => {
                    results.push(format!("document {index}: {msg}"));
                    continue;
                }
            };
            let doc = match self.resolve(doc, index) {
                Ok(doc) => doc,
                Err(msg) => {
                    results.push(msg);
                    continue;
                }
            };
            match doc.handle.delete().await {
                Ok(_) => results.push(format!("{}/{} deleted", doc.kind, doc.name)),
                Err(e) if e.is_not_found() => {
                    results.push(format!("{}/{} not found", doc.kind, doc.name));
                }
                Err(e) => results.push(format!("{}/{} delete failed: {e}", doc.kind, doc.name)),
            }
        }
        results
    }

    /// Extract coordinates from a document and bind a fluent handle.
    fn resolve(&self, value: Value, index: usize) -> Result<DocRef, String> {
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if api_version.is_empty() || kind.is_empty() {
            return Err(format!("document {index}: missing Group, Version or Kind"));
        }
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let name = match crate::filter::lookup_path(&value, "metadata.name").and_then(Value::as_str)
        {
            Some(n) => n.to_string(),
            None => return Err(format!("document {index}: missing metadata.name")),
        };

        let mut handle = Kubectl::new(self.cluster.clone())
            .gvk(group, version, kind)
            .name(&name);
        if let Some(ns) =
            crate::filter::lookup_path(&value, "metadata.namespace").and_then(Value::as_str)
        {
            handle = handle.namespace(ns);
        }
        if let Some(err) = handle.err() {
            return Err(format!("{kind}/{name} failed: {err}"));
        }
        Ok(DocRef {
            kind: kind.to_string(),
            name,
            handle,
            value,
        })
    }

    /// Create-or-update: probe with a get, branch on not-found.
    async fn apply_one(&self, doc: DocRef) -> String {
        match doc.handle.get::<Value>().await {
            Ok(_) => match doc.handle.update(&doc.value).await {
                Ok(_) => format!("{}/{} updated", doc.kind, doc.name),
                Err(e) => format!("{}/{} update failed: {e}", doc.kind, doc.name),
            },
            Err(e) if e.is_not_found() => {
                debug!(kind = %doc.kind, name = %doc.name, "not present, creating");
                match doc.handle.create(&doc.value).await {
                    Ok(_) => format!("{}/{} created", doc.kind, doc.name),
                    Err(e) => format!("{}/{} create failed: {e}", doc.kind, doc.name),
                }
            }
            Err(e) => format!("{}/{} apply failed: {e}", doc.kind, doc.name),
        }
    }
}

/// Split a multi-document YAML string into JSON values. `Ok(None)` marks an
/// empty document (a bare `---` separator).
fn parse_documents(yaml: &str) -> Vec<Result<Option<Value>, String>> {
    serde_yaml::Deserializer::from_str(yaml)
        .map(|doc| match Value::deserialize(doc) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(format!("YAML parse failed: {e}")),
        })
        .collect()
}
