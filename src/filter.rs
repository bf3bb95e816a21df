// SPDX-License-Identifier: BSD-3-Clause

//! Structured query filter.
//!
//! A [`Filter`] accumulates the conditions, pagination, ordering and
//! selector fragments a fluent chain or SQL statement produces. Conditions
//! keep insertion order so the SQL fragment kept for diagnostics can be
//! reconstructed deterministically.

use serde_json::Value;

/// Comparison operator of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

/// One `field <op> value` predicate.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: Operator::Eq,
            value: value.into(),
        }
    }

    /// SQL-ish rendering used for the diagnostic fragment.
    pub fn render(&self) -> String {
        match &self.value {
            Value::String(s) => format!("{}{}'{}'", self.field, self.operator.as_str(), s),
            other => format!("{}{}{}", self.field, self.operator.as_str(), other),
        }
    }

    /// Evaluate this condition against a resource serialized as JSON.
    ///
    /// `labels.<key>` is shorthand for `metadata.labels.<key>`; any other
    /// field is a literal dotted path into the object.
    pub fn matches(&self, object: &Value) -> bool {
        let actual = lookup_path(object, &self.field);
        let actual = match actual {
            Some(v) => v,
            None => return matches!(self.operator, Operator::Ne),
        };
        compare(actual, &self.value, self.operator)
    }
}

/// Resolve a dotted field path inside a resource JSON object.
pub fn lookup_path<'a>(object: &'a Value, field: &str) -> Option<&'a Value> {
    let path: Vec<&str> = if let Some(key) = field.strip_prefix("labels.") {
        vec!["metadata", "labels", key]
    } else if let Some(key) = field.strip_prefix("annotations.") {
        vec!["metadata", "annotations", key]
    } else {
        field.split('.').collect()
    };
    let mut current = object;
    for part in path {
        current = current.get(part)?;
    }
    Some(current)
}

fn compare(actual: &Value, expected: &Value, op: Operator) -> bool {
    // Numeric comparison when both sides are numbers (or parse as such),
    // string comparison otherwise.
    let ord = match (as_f64(actual), as_f64(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(as_string(actual).cmp(&as_string(expected))),
    };
    let ord = match ord {
        Some(o) => o,
        None => return false,
    };
    match op {
        Operator::Eq => ord.is_eq(),
        Operator::Ne => !ord.is_eq(),
        Operator::Lt => ord.is_lt(),
        Operator::Le => ord.is_le(),
        Operator::Gt => ord.is_gt(),
        Operator::Ge => ord.is_ge(),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Structured representation of query conditions, pagination, ordering and
/// selectors for one request.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Predicates in insertion order.
    pub conditions: Vec<Condition>,
    /// Accumulated SQL-ish text of the query, for display and debugging.
    pub sql: String,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Raw order expression, e.g. `metadata.creationTimestamp desc`.
    pub order: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl Filter {
    /// Append a condition, keeping the diagnostic SQL fragment in step.
    pub fn push_condition(&mut self, cond: Condition) {
        self.append_sql(&cond.render());
        self.conditions.push(cond);
    }

    /// Append a raw fragment to the diagnostic SQL text.
    pub fn append_sql(&mut self, fragment: &str) {
        if !self.sql.is_empty() {
            self.sql.push_str(" and ");
        }
        self.sql.push_str(fragment);
    }

    /// Merge a label selector fragment; repeated calls join with `,` and
    /// never overwrite earlier fragments.
    pub fn merge_label_selector(&mut self, fragment: &str) {
        merge_selector(&mut self.label_selector, fragment);
    }

    /// Merge a field selector fragment, comma-joined like label selectors.
    pub fn merge_field_selector(&mut self, fragment: &str) {
        merge_selector(&mut self.field_selector, fragment);
    }

    /// Apply conditions, ordering and pagination to a fetched item list.
    ///
    /// Selector fragments are not re-checked here; they were pushed down to
    /// the API server.
    pub fn apply(&self, items: Vec<Value>) -> Vec<Value> {
        let mut items: Vec<Value> = items
            .into_iter()
            .filter(|item| self.conditions.iter().all(|c| c.matches(item)))
            .collect();

        if let Some(order) = &self.order {
            let (field, descending) = parse_order(order);
            items.sort_by(|a, b| {
                let av = lookup_path(a, &field).map(as_string).unwrap_or_default();
                let bv = lookup_path(b, &field).map(as_string).unwrap_or_default();
                let ord = match (av.parse::<f64>(), bv.parse::<f64>()) {
                    (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                    _ => av.cmp(&bv),
                };
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let offset = self.offset.unwrap_or(0) as usize;
        let mut items: Vec<Value> = items.into_iter().skip(offset).collect();
        if let Some(limit) = self.limit {
            items.truncate(limit as usize);
        }
        items
    }
}

fn merge_selector(slot: &mut Option<String>, fragment: &str) {
    if fragment.is_empty() {
        return;
    }
    match slot {
        Some(existing) => {
            existing.push(',');
            existing.push_str(fragment);
        }
        None => *slot = Some(fragment.to_string()),
    }
}

fn parse_order(order: &str) -> (String, bool) {
    let mut parts = order.split_whitespace();
    let field = parts.next().unwrap_or_default().to_string();
    let descending = parts
        .next()
        .map(|d| d.eq_ignore_ascii_case("desc"))
        .unwrap_or(false);
    (field, descending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, ns: &str, labels: Value) -> Value {
        json!({
            "metadata": {"name": name, "namespace": ns, "labels": labels},
            "status": {"phase": "Running"}
        })
    }

    #[test]
    fn condition_matches_metadata_and_label_paths() {
        let p = pod("web-0", "prod", json!({"app": "web"}));
        assert!(Condition::eq("metadata.name", "web-0").matches(&p));
        assert!(Condition::eq("labels.app", "web").matches(&p));
        assert!(Condition::eq("status.phase", "Running").matches(&p));
        assert!(!Condition::eq("labels.app", "db").matches(&p));
        // Missing field only satisfies `!=`.
        assert!(!Condition::eq("labels.tier", "x").matches(&p));
    }

    #[test]
    fn selector_fragments_merge_with_comma() {
        let mut f = Filter::default();
        f.merge_label_selector("app=test");
        f.merge_label_selector("env=prod");
        assert_eq!(f.label_selector.as_deref(), Some("app=test,env=prod"));

        f.merge_field_selector("spec.nodeName=node1");
        f.merge_field_selector("status.phase=Running");
        assert_eq!(
            f.field_selector.as_deref(),
            Some("spec.nodeName=node1,status.phase=Running")
        );
    }

    #[test]
    fn conditions_keep_insertion_order_in_sql_fragment() {
        let mut f = Filter::default();
        f.push_condition(Condition::eq("metadata.namespace", "ns1"));
        f.push_condition(Condition::eq("labels.app", "web"));
        assert_eq!(f.sql, "metadata.namespace='ns1' and labels.app='web'");
    }

    #[test]
    fn apply_filters_orders_and_paginates() {
        let items = vec![
            pod("c", "ns1", json!({"app": "web"})),
            pod("a", "ns1", json!({"app": "web"})),
            pod("b", "ns2", json!({"app": "web"})),
            pod("d", "ns1", json!({"app": "db"})),
        ];
        let mut f = Filter::default();
        f.push_condition(Condition::eq("metadata.namespace", "ns1"));
        f.push_condition(Condition::eq("labels.app", "web"));
        f.order = Some("metadata.name".into());
        let out = f.apply(items.clone());
        let names: Vec<_> = out
            .iter()
            .map(|v| v["metadata"]["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c"]);

        f.order = Some("metadata.name desc".into());
        f.limit = Some(1);
        let out = f.apply(items);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["metadata"]["name"], "c");
    }
}
