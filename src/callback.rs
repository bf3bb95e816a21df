// SPDX-License-Identifier: BSD-3-Clause

//! Callback pipeline: named, ordered step chains per verb.
//!
//! Every verb owns a [`Processor`], a chain of named steps executed in order
//! for each request. Chains are seeded once with their default
//! `kubectl:<verb>` operation step; interceptors registered afterwards can
//! anchor themselves before or after any named step, or before/after the
//! whole chain with the `"*"` wildcard. Wildcard anchors are resolved at
//! registration time, so the relative order of two wildcard-anchored steps
//! is their registration order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use kube::api::DynamicObject;
use kube::runtime::watcher;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::cluster::ClusterInst;
use crate::error::{Error, Result};
use crate::statement::Statement;

/// The closed set of verbs carrying their own step chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Delete,
    Patch,
    Exec,
    Logs,
    Watch,
    Describe,
    Doc,
}

impl Verb {
    pub const ALL: [Verb; 11] = [
        Verb::Get,
        Verb::List,
        Verb::Create,
        Verb::Update,
        Verb::Delete,
        Verb::Patch,
        Verb::Exec,
        Verb::Logs,
        Verb::Watch,
        Verb::Describe,
        Verb::Doc,
    ];
}

/// The per-request context threaded through a chain.
///
/// Steps communicate through the JSON `output` slot (or `stream` for Watch);
/// the terminal verb method deserializes it into the caller's type.
pub struct Invocation {
    pub cluster: Arc<ClusterInst>,
    pub stmt: Statement,
    pub output: Option<Value>,
    pub stream: Option<mpsc::Receiver<watcher::Event<DynamicObject>>>,
}

impl Invocation {
    pub fn new(cluster: Arc<ClusterInst>, stmt: Statement) -> Self {
        Self {
            cluster,
            stmt,
            output: None,
            stream: None,
        }
    }
}

/// A step handler: takes the invocation, does its work, passes it on.
pub type StepFuture = BoxFuture<'static, Result<Invocation>>;
pub type StepHandler = Arc<dyn Fn(Invocation) -> StepFuture + Send + Sync>;

#[derive(Clone)]
struct Step {
    name: String,
    handler: StepHandler,
}

/// Where a pending registration should land in the chain.
#[derive(Debug, Clone)]
enum Anchor {
    Tail,
    Before(String),
    After(String),
}

/// A named, ordered chain of steps for one verb.
pub struct Processor {
    steps: RwLock<Vec<Step>>,
}

impl Processor {
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(Vec::new()),
        }
    }

    /// Append a step at the end of the chain.
    ///
    /// Registering a name that already exists removes the old step first and
    /// inserts the new one at the requested position (last registration
    /// wins); use [`Processor::replace`] to swap a handler in place.
    pub fn register(&self, name: impl Into<String>, handler: StepHandler) {
        self.insert(name.into(), handler, Anchor::Tail);
    }

    /// Scope the next `register` to insert immediately before `anchor`
    /// (`"*"` = before the first step present at registration time).
    pub fn before(&self, anchor: impl Into<String>) -> Anchored<'_> {
        Anchored {
            proc: self,
            anchor: Anchor::Before(anchor.into()),
        }
    }

    /// Scope the next `register` to insert immediately after `anchor`
    /// (`"*"` = after the last step present at registration time).
    pub fn after(&self, anchor: impl Into<String>) -> Anchored<'_> {
        Anchored {
            proc: self,
            anchor: Anchor::After(anchor.into()),
        }
    }

    /// Swap the handler of an existing step, keeping its position. Appends
    /// at the end if the name is not registered yet.
    pub fn replace(&self, name: impl Into<String>, handler: StepHandler) {
        let name = name.into();
        let mut steps = self.steps.write().expect("callback chain lock poisoned");
        if let Some(step) = steps.iter_mut().find(|s| s.name == name) {
            step.handler = handler;
        } else {
            steps.push(Step { name, handler });
        }
    }

    /// Delete a step; the relative order of the remaining steps is kept.
    pub fn remove(&self, name: &str) {
        let mut steps = self.steps.write().expect("callback chain lock poisoned");
        steps.retain(|s| s.name != name);
    }

    /// Look up a step handler by name; `None` if absent.
    pub fn get(&self, name: &str) -> Option<StepHandler> {
        let steps = self.steps.read().expect("callback chain lock poisoned");
        steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.handler.clone())
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<String> {
        let steps = self.steps.read().expect("callback chain lock poisoned");
        steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Run every step strictly in chain order. The first error aborts the
    /// chain and becomes the pipeline result; later steps do not run and no
    /// rollback is attempted.
    pub async fn execute(&self, mut inv: Invocation) -> Result<Invocation> {
        let snapshot: Vec<Step> = {
            let steps = self.steps.read().expect("callback chain lock poisoned");
            steps.clone()
        };
        if snapshot.is_empty() {
            return Err(Error::pipeline("no steps registered for this verb"));
        }
        for step in snapshot {
            trace!(step = %step.name, "executing callback step");
            inv = (step.handler)(inv).await?;
        }
        Ok(inv)
    }

    fn insert(&self, name: String, handler: StepHandler, anchor: Anchor) {
        let mut steps = self.steps.write().expect("callback chain lock poisoned");
        if steps.iter().any(|s| s.name == name) {
            warn!(step = %name, "step re-registered; previous registration discarded");
            steps.retain(|s| s.name != name);
        }
        let pos = match &anchor {
            Anchor::Tail => steps.len(),
            Anchor::Before(a) if a == "*" => 0,
            Anchor::After(a) if a == "*" => steps.len(),
            Anchor::Before(a) => match steps.iter().position(|s| &s.name == a) {
                Some(i) => i,
                None => {
                    warn!(step = %name, anchor = %a, "anchor not found; appending at end");
                    steps.len()
                }
            },
            Anchor::After(a) => match steps.iter().position(|s| &s.name == a) {
                Some(i) => i + 1,
                None => {
                    warn!(step = %name, anchor = %a, "anchor not found; appending at end");
                    steps.len()
                }
            },
        };
        steps.insert(pos, Step { name, handler });
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

/// A scoped view of a [`Processor`] whose next `register` call inserts at
/// the anchored position.
pub struct Anchored<'p> {
    proc: &'p Processor,
    anchor: Anchor,
}

impl Anchored<'_> {
    pub fn register(&self, name: impl Into<String>, handler: StepHandler) {
        self.proc.insert(name.into(), handler, self.anchor.clone());
    }
}

/// The full per-cluster set of verb chains.
pub struct Callbacks {
    processors: HashMap<Verb, Processor>,
}

impl Callbacks {
    /// Create one empty processor per verb. The caller seeds the default
    /// operation steps before any interceptors are registered.
    pub fn new() -> Self {
        let processors = Verb::ALL
            .iter()
            .map(|v| (*v, Processor::new()))
            .collect();
        Self { processors }
    }

    pub fn processor(&self, verb: Verb) -> &Processor {
        // Every verb is inserted in `new`, so the lookup cannot miss.
        self.processors.get(&verb).expect("verb chain missing")
    }

    pub fn get(&self) -> &Processor {
        self.processor(Verb::Get)
    }

    pub fn list(&self) -> &Processor {
        self.processor(Verb::List)
    }

    pub fn create(&self) -> &Processor {
        self.processor(Verb::Create)
    }

    pub fn update(&self) -> &Processor {
        self.processor(Verb::Update)
    }

    pub fn delete(&self) -> &Processor {
        self.processor(Verb::Delete)
    }

    pub fn patch(&self) -> &Processor {
        self.processor(Verb::Patch)
    }

    pub fn exec(&self) -> &Processor {
        self.processor(Verb::Exec)
    }

    pub fn logs(&self) -> &Processor {
        self.processor(Verb::Logs)
    }

    pub fn watch(&self) -> &Processor {
        self.processor(Verb::Watch)
    }

    pub fn describe(&self) -> &Processor {
        self.processor(Verb::Describe)
    }

    pub fn doc(&self) -> &Processor {
        self.processor(Verb::Doc)
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::new()
    }
}
