//! Kubernetes container index.
//!
//! Watches the pods scheduled on this node and keeps a map from the cgroup
//! name a container runs under to the container's pod identity. The collector
//! uses it both as the set of cgroups to report and to label them.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, runtime::watcher};
use log::{debug, warn};
use schedlat_common::CgroupName;

use crate::{
    collector::{ContainerInfo, ContainerLookup},
    settings::CgroupDriver,
};

#[derive(Default)]
struct IndexState {
    containers: HashMap<CgroupName, ContainerInfo>,
    /// pod uid -> cgroup names registered for it.
    pods: HashMap<String, Vec<CgroupName>>,
}

pub struct ContainerIndex {
    driver: CgroupDriver,
    state: RwLock<IndexState>,
}

impl ContainerIndex {
    pub fn new(driver: CgroupDriver) -> Self {
        Self {
            driver,
            state: RwLock::new(IndexState::default()),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.read().map(|s| s.containers.len()).unwrap_or(0)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn get(&self, cgroup: &CgroupName) -> Option<ContainerInfo> {
        self.state.read().ok()?.containers.get(cgroup).cloned()
    }

    /// Start the pod watcher for `node_name`.
    pub async fn start_watcher(
        self: &Arc<Self>,
        node_name: String,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let client = Client::try_default()
            .await
            .context("Failed to create K8s client (not running in cluster?)")?;

        let api: Api<Pod> = Api::all(client);
        let watcher_config = watcher::Config {
            field_selector: Some(format!("spec.nodeName={}", node_name)),
            ..Default::default()
        };

        let index = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let stream = watcher(api, watcher_config);
            tokio::pin!(stream);

            while let Some(event) = stream.next().await {
                match event {
                    Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                        index.apply_pod(&pod);
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        index.remove_pod(&pod);
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
                    Err(e) => {
                        // kube's watcher retries with backoff
                        warn!("K8s pod watcher error: {}. Will retry.", e);
                    }
                }
            }

            warn!("K8s pod watcher stream ended");
        });

        Ok(handle)
    }

    fn apply_pod(&self, pod: &Pod) {
        let metadata = &pod.metadata;
        let (Some(pod_uid), Some(pod_name)) = (&metadata.uid, &metadata.name) else {
            return;
        };
        let pod_namespace = metadata.namespace.clone().unwrap_or_default();

        let entries: Vec<(CgroupName, ContainerInfo)> = running_containers(pod)
            .into_iter()
            .filter_map(|(container_name, runtime_id)| {
                let (runtime, container_id) = parse_container_id(&runtime_id)?;
                let cgroup = container_cgroup_name(self.driver, runtime, container_id);
                Some((
                    CgroupName::new(&cgroup),
                    ContainerInfo {
                        container_id: container_id.to_string(),
                        container_name,
                        pod_uid: pod_uid.clone(),
                        pod_name: pod_name.clone(),
                        pod_namespace: pod_namespace.clone(),
                    },
                ))
            })
            .collect();

        let Ok(mut state) = self.state.write() else {
            return;
        };
        // Restarted containers get new ids; drop the previous generation.
        if let Some(previous) = state.pods.remove(pod_uid) {
            for cgroup in previous {
                state.containers.remove(&cgroup);
            }
        }
        debug!(
            "Pod {}/{}: {} containers",
            pod_namespace,
            pod_name,
            entries.len()
        );
        let cgroups = entries.iter().map(|(cgroup, _)| *cgroup).collect();
        state.containers.extend(entries);
        state.pods.insert(pod_uid.clone(), cgroups);
    }

    fn remove_pod(&self, pod: &Pod) {
        let Some(pod_uid) = &pod.metadata.uid else {
            return;
        };
        if let Ok(mut state) = self.state.write()
            && let Some(cgroups) = state.pods.remove(pod_uid)
        {
            for cgroup in cgroups {
                state.containers.remove(&cgroup);
            }
        }
    }
}

impl ContainerLookup for ContainerIndex {
    fn containers(&self) -> Vec<(CgroupName, ContainerInfo)> {
        self.state
            .read()
            .map(|s| {
                s.containers
                    .iter()
                    .map(|(cgroup, info)| (*cgroup, info.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `(container name, "<runtime>://<id>")` for every container with an id.
fn running_containers(pod: &Pod) -> Vec<(String, String)> {
    let mut containers = Vec::new();

    if let Some(status) = &pod.status {
        for statuses in [&status.container_statuses, &status.init_container_statuses]
            .into_iter()
            .flatten()
        {
            for cs in statuses {
                if let Some(cid) = &cs.container_id {
                    containers.push((cs.name.clone(), cid.clone()));
                }
            }
        }
    }

    containers
}

/// Splits `"<runtime>://<id>"`.
fn parse_container_id(id: &str) -> Option<(&str, &str)> {
    let (runtime, container_id) = id.split_once("://")?;
    if runtime.is_empty() || container_id.is_empty() {
        return None;
    }
    Some((runtime, container_id))
}

/// Leaf cgroup directory name the runtime creates for a container.
pub fn container_cgroup_name(driver: CgroupDriver, runtime: &str, container_id: &str) -> String {
    match driver {
        CgroupDriver::Cgroupfs => container_id.to_string(),
        CgroupDriver::Systemd => {
            let prefix = match runtime {
                "containerd" => "cri-containerd",
                "cri-o" => "crio",
                other => other,
            };
            format!("{}-{}.scope", prefix, container_id)
        }
    }
}
