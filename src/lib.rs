// SPDX-License-Identifier: BSD-3-Clause

//! Multi-cluster Kubernetes resource access with a fluent, branchable
//! query handle and a constrained SQL surface.
//!
//! Register clusters with the [`ClusterRegistry`] (or the process-wide
//! [`clusters`] singleton), then query them through [`Kubectl`] handles:
//!
//! ```no_run
//! use k8s_openapi::api::core::v1::Pod;
//! use kubeq::{clusters, RegisterOptions};
//!
//! # async fn example() -> kubeq::Result<()> {
//! let config = kube::Config::infer().await.expect("kubeconfig");
//! clusters()
//!     .register_by_config_with_id("prod", config, RegisterOptions::new())
//!     .await?;
//!
//! let prod = kubeq::cluster("prod").expect("registered");
//! let pods: Vec<Pod> = prod
//!     .sql("select * from pods where metadata.namespace='kube-system'")
//!     .list()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! Every request runs through a per-verb callback chain; interceptors can
//! be anchored before or after the default `kubectl:<verb>` steps for
//! auditing, mutation or replacement (see [`callback`]).

pub mod applier;
pub mod builtin;
pub mod cache;
pub mod callback;
pub mod cluster;
pub mod ctl;
pub mod error;
pub mod filter;
pub mod kubectl;
pub mod resolver;
pub mod sql;
pub mod statement;
mod steps;

pub use applier::Applier;
pub use cache::{CacheConfig, ClusterCache};
pub use callback::{Callbacks, Invocation, Processor, StepFuture, StepHandler, Verb};
pub use cluster::{
    cluster, clusters, default_cluster, ClusterInst, ClusterRegistry, CredentialProvider,
    RegisterOptions, Token,
};
pub use ctl::Ctl;
pub use error::{Error, Result};
pub use filter::{Condition, Filter, Operator};
pub use kubectl::Kubectl;
pub use resolver::{Resolved, Resolver};
pub use sql::{parse_select, ParsedQuery};
pub use statement::{PatchType, Statement};
