//! Narrow pod-lookup interface over the cluster.
//!
//! The daemon never talks Kubernetes API machinery itself; it resolves a
//! workload to a running pod through this trait. The production
//! implementation shells out to `kubectl`, which keeps kubeconfig handling
//! and auth entirely outside the core.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait PodResolver: Send + Sync {
    /// Resolves a workload to the name of a running pod backing it.
    async fn resolve_pod(
        &self,
        kubeconfig: Option<&Path>,
        namespace: &str,
        workload_type: &str,
        workload: &str,
    ) -> Result<String>;
}

/// `kubectl get pods`-backed resolver.
pub struct KubectlPodResolver {
    kubectl: Option<PathBuf>,
}

impl KubectlPodResolver {
    pub fn new(kubectl_path: Option<&str>) -> Self {
        Self {
            kubectl: kubectl_path.map(PathBuf::from),
        }
    }

    fn kubectl_binary(&self) -> Result<PathBuf> {
        match &self.kubectl {
            Some(path) => Ok(path.clone()),
            None => which::which("kubectl").context("kubectl not found in PATH"),
        }
    }
}

#[async_trait]
impl PodResolver for KubectlPodResolver {
    async fn resolve_pod(
        &self,
        kubeconfig: Option<&Path>,
        namespace: &str,
        workload_type: &str,
        workload: &str,
    ) -> Result<String> {
        let kubectl = self.kubectl_binary()?;
        let mut cmd = tokio::process::Command::new(&kubectl);
        cmd.args(["get", "pods", "-n", namespace, "-o", "json"]);
        if let Some(path) = kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run {}", kubectl.display()))?;
        if !output.status.success() {
            bail!(
                "kubectl get pods failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let pods: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("Failed to parse kubectl output")?;
        pick_pod(&pods, workload).with_context(|| {
            format!(
                "No running pod found for {}/{} in namespace {}",
                workload_type, workload, namespace
            )
        })
    }
}

/// Picks a running pod for a workload: prefer an `app` label match, fall back
/// to a name-prefix match (pods of a workload carry its name as a prefix).
fn pick_pod(pods: &serde_json::Value, workload: &str) -> Option<String> {
    let items = pods.get("items")?.as_array()?;
    let running = |pod: &&serde_json::Value| {
        pod.pointer("/status/phase").and_then(|p| p.as_str()) == Some("Running")
    };
    let name_of = |pod: &serde_json::Value| {
        pod.pointer("/metadata/name")
            .and_then(|n| n.as_str())
            .map(|s| s.to_string())
    };

    if let Some(pod) = items.iter().filter(running).find(|pod| {
        pod.pointer("/metadata/labels/app").and_then(|l| l.as_str()) == Some(workload)
    }) {
        return name_of(pod);
    }
    items
        .iter()
        .filter(running)
        .find(|pod| {
            name_of(pod)
                .map(|n| n.starts_with(&format!("{}-", workload)))
                .unwrap_or(false)
        })
        .and_then(name_of)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_json(name: &str, app_label: Option<&str>, phase: &str) -> serde_json::Value {
        let mut metadata = serde_json::json!({ "name": name });
        if let Some(app) = app_label {
            metadata["labels"] = serde_json::json!({ "app": app });
        }
        serde_json::json!({ "metadata": metadata, "status": { "phase": phase } })
    }

    #[test]
    fn test_pick_pod_prefers_app_label() {
        let pods = serde_json::json!({ "items": [
            pod_json("ratings-v1-abc12", None, "Running"),
            pod_json("web-55f9d", Some("ratings"), "Running"),
        ]});
        assert_eq!(pick_pod(&pods, "ratings").unwrap(), "web-55f9d");
    }

    #[test]
    fn test_pick_pod_falls_back_to_name_prefix() {
        let pods = serde_json::json!({ "items": [
            pod_json("other-v1-abc12", None, "Running"),
            pod_json("ratings-v1-def34", None, "Running"),
        ]});
        assert_eq!(pick_pod(&pods, "ratings").unwrap(), "ratings-v1-def34");
    }

    #[test]
    fn test_pick_pod_skips_non_running() {
        let pods = serde_json::json!({ "items": [
            pod_json("ratings-v1-abc12", Some("ratings"), "Pending"),
        ]});
        assert!(pick_pod(&pods, "ratings").is_none());
    }
}
