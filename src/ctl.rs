// SPDX-License-Identifier: BSD-3-Clause

//! Label and annotation editing.
//!
//! `kubectl label` syntax: `key=value` sets, a trailing `-` removes.
//! Edits are applied as one merge patch, so setting and removing in the
//! same call is atomic on the server side.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::kubectl::Kubectl;
use crate::statement::PatchType;

/// Metadata-editing helpers over one fluent branch. The branch must have a
/// resource and name selected.
pub struct Ctl {
    kubectl: Kubectl,
}

impl Ctl {
    pub(crate) fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    /// Apply label edits, e.g. `["team=infra", "deprecated-"]`.
    pub async fn label(&self, entries: &[&str]) -> Result<Value> {
        self.patch_metadata("labels", entries).await
    }

    /// Apply annotation edits, same syntax as [`Ctl::label`].
    pub async fn annotate(&self, entries: &[&str]) -> Result<Value> {
        self.patch_metadata("annotations", entries).await
    }

    async fn patch_metadata(&self, field: &str, entries: &[&str]) -> Result<Value> {
        let edits = parse_entries(entries)?;
        let mut metadata = Map::new();
        metadata.insert(field.to_string(), Value::Object(edits));
        let body = json!({ "metadata": metadata });
        self.kubectl
            .patch_type(PatchType::Merge)
            .patch(body)
            .await
    }
}

/// Parse `key=value` / `key-` entries into a merge-patch fragment where a
/// removal maps to an explicit null.
fn parse_entries(entries: &[&str]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for entry in entries {
        if let Some((key, value)) = entry.split_once('=') {
            if key.is_empty() {
                return Err(Error::syntax(format!("empty key in {entry:?}")));
            }
            map.insert(key.to_string(), Value::String(value.to_string()));
        } else if let Some(key) = entry.strip_suffix('-') {
            if key.is_empty() {
                return Err(Error::syntax(format!("empty key in {entry:?}")));
            }
            map.insert(key.to_string(), Value::Null);
        } else {
            return Err(Error::syntax(format!(
                "expected key=value or key- in {entry:?}"
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_parse_into_sets_and_removals() {
        let map = parse_entries(&["team=infra", "deprecated-"]).unwrap();
        assert_eq!(map["team"], Value::String("infra".into()));
        assert_eq!(map["deprecated"], Value::Null);
    }

    #[test]
    fn empty_value_is_allowed_empty_key_is_not() {
        let map = parse_entries(&["flag="]).unwrap();
        assert_eq!(map["flag"], Value::String(String::new()));
        assert!(matches!(parse_entries(&["=x"]), Err(Error::Syntax(_))));
        assert!(matches!(parse_entries(&["-"]), Err(Error::Syntax(_))));
    }

    #[test]
    fn bare_token_is_rejected() {
        let err = parse_entries(&["oops"]).unwrap_err();
        assert!(err.to_string().contains("oops"));
    }
}
