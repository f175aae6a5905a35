//! Clients for workload clusters, built from the kubeconfig Cluster API stores
//! next to every cluster.

use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::*;

use crate::{Error, Result, helper};

/// Key holding the kubeconfig in the `<cluster>-kubeconfig` secret
pub const KUBECONFIG_KEY: &str = "value";

pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

/// Client for the workload cluster `namespace/name`.
pub async fn workload_client(client: &Client, namespace: &str, name: &str) -> Result<Client> {
    let secret_name = kubeconfig_secret_name(name);
    let secret = helper::get_secret_opt(client, namespace, &secret_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("kubeconfig secret {namespace}/{secret_name}")))?;
    let raw = helper::secret_string(&secret, KUBECONFIG_KEY)?;
    client_from_kubeconfig(&raw).await.inspect_err(|e| {
        warn!(cluster = %format!("{namespace}/{name}"), "failed to build workload cluster client: {e}")
    })
}

pub async fn client_from_kubeconfig(raw: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::RemoteClusterError(format!("invalid kubeconfig: {e}")))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::RemoteClusterError(format!("kubeconfig rejected: {e}")))?;
    Client::try_from(config).map_err(Error::KubeError)
}
