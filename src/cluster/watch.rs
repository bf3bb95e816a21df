// SPDX-License-Identifier: BSD-3-Clause

//! Background CRD watch keeping the per-cluster snapshot current.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::ClusterInst;

/// Watch CRDs on `cluster` and fold the event stream into its snapshot.
/// The initial listing replaces the snapshot wholesale; later events apply
/// incrementally. Stream errors are logged and the watcher resumes after
/// the backoff applied below.
pub(crate) fn spawn_crd_watch(
    cluster: Arc<ClusterInst>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let api: Api<CustomResourceDefinition> = Api::all(cluster.client().clone());
        // default_backoff keeps a persistently failing stream from being
        // re-polled in a tight loop.
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        let mut init_buffer: Vec<CustomResourceDefinition> = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(cluster = %cluster.id(), "crd watch cancelled");
                    return;
                }
                event = stream.next() => {
                    let Some(event) = event else {
                        debug!(cluster = %cluster.id(), "crd watch stream ended");
                        return;
                    };
                    match event {
                        Ok(watcher::Event::Init) => init_buffer.clear(),
                        Ok(watcher::Event::InitApply(crd)) => init_buffer.push(crd),
                        Ok(watcher::Event::InitDone) => {
                            debug!(
                                cluster = %cluster.id(),
                                crds = init_buffer.len(),
                                "crd snapshot initialized"
                            );
                            cluster.replace_crds(std::mem::take(&mut init_buffer));
                        }
                        Ok(watcher::Event::Apply(crd)) => cluster.upsert_crd(crd),
                        Ok(watcher::Event::Delete(crd)) => {
                            if let Some(name) = crd.metadata.name.as_deref() {
                                cluster.remove_crd(name);
                            }
                        }
                        Err(e) => {
                            warn!(cluster = %cluster.id(), error = %e, "crd watch error");
                        }
                    }
                }
            }
        }
    })
}
