//! Kubernetes API client.
//!
//! A deliberately narrow, read-only consumer of the service and node
//! inventory. Credentials resolve in order: explicit kubeconfig path,
//! in-cluster service account, default user kubeconfig.

use crate::cluster::{
    AddressKind, ClusterInventory, NodeAddress, NodeRecord, ServicePort, ServiceRecord,
    ServiceType,
};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the cluster API server.
#[derive(Debug)]
pub struct ApiClient {
    server: String,
    token: Option<String>,
    client: reqwest::Client,
    context: String,
}

impl ApiClient {
    /// Client for a given API server URL with anonymous access. Used when the
    /// server needs no credentials (local test servers, proxied API access).
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: normalize_server(server.into()),
            token: None,
            client: reqwest::Client::new(),
            context: "direct".to_string(),
        }
    }

    /// Resolve credentials and build a client.
    ///
    /// A non-empty `kubeconfig_path` is used as-is. Otherwise in-cluster
    /// credentials are tried first, then the default user kubeconfig.
    pub fn connect(kubeconfig_path: &str) -> anyhow::Result<Self> {
        if !kubeconfig_path.is_empty() {
            return Self::from_kubeconfig(Path::new(kubeconfig_path));
        }

        match Self::in_cluster() {
            Ok(client) => Ok(client),
            Err(e) => {
                tracing::debug!("in-cluster credentials unavailable: {:#}", e);
                let path = default_kubeconfig_path()
                    .context("cannot determine the default kubeconfig location")?;
                Self::from_kubeconfig(&path)
            }
        }
    }

    /// The credential source this client was built from, for startup logging.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Build from the mounted service-account credentials.
    fn in_cluster() -> anyhow::Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set")?;

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(dir.join("token"))
            .context("failed to read service account token")?;
        let ca_pem =
            std::fs::read(dir.join("ca.crt")).context("failed to read service account CA")?;

        let server = if host.contains(':') {
            format!("https://[{}]:{}", host, port)
        } else {
            format!("https://{}:{}", host, port)
        };

        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .context("service account CA is not valid PEM")?;
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .add_root_certificate(ca)
            .build()?;

        Ok(Self {
            server,
            token: Some(token.trim().to_string()),
            client,
            context: "in-cluster".to_string(),
        })
    }

    /// Build from a kubeconfig file. Supports the bearer-token subset;
    /// client certificates and exec plugins are not understood.
    fn from_kubeconfig(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        let kubeconfig: Kubeconfig =
            serde_yaml::from_str(&data).context("failed to parse kubeconfig")?;

        let context_name = if kubeconfig.current_context.is_empty() {
            kubeconfig
                .contexts
                .first()
                .map(|c| c.name.clone())
                .context("kubeconfig has no contexts")?
        } else {
            kubeconfig.current_context.clone()
        };

        let context = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .with_context(|| format!("kubeconfig context '{}' not found", context_name))?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .with_context(|| format!("kubeconfig cluster '{}' not found", context.context.cluster))?;

        let token = kubeconfig
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .and_then(|u| u.user.token.clone());

        let mut builder = reqwest::Client::builder().timeout(API_TIMEOUT);

        if cluster.cluster.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(pem) = cluster.cluster.ca_pem()? {
            let ca = reqwest::Certificate::from_pem(&pem)
                .context("kubeconfig certificate authority is not valid PEM")?;
            builder = builder.add_root_certificate(ca);
        }

        Ok(Self {
            server: normalize_server(cluster.cluster.server.clone()),
            token,
            client: builder.build()?,
            context: context_name,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.server, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("cluster API request failed: {} - {}", status, body);
        }

        Ok(response.json().await?)
    }

    fn service_from_item(item: ServiceItem) -> ServiceRecord {
        ServiceRecord {
            namespace: item.metadata.namespace,
            name: item.metadata.name,
            annotations: item.metadata.annotations,
            service_type: ServiceType::parse(&item.spec.service_type),
            cluster_ip: item.spec.cluster_ip,
            ports: item
                .spec
                .ports
                .into_iter()
                .map(|p| ServicePort {
                    name: p.name,
                    node_port: clamp_port(p.node_port),
                    target_port: p.target_port.map(|t| t.as_port()).unwrap_or(0),
                })
                .collect(),
        }
    }

    fn node_from_item(item: NodeItem) -> NodeRecord {
        NodeRecord {
            name: item.metadata.name,
            addresses: item
                .status
                .addresses
                .into_iter()
                .map(|a| NodeAddress {
                    kind: AddressKind::parse(&a.kind),
                    address: a.address,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ClusterInventory for ApiClient {
    async fn list_services(&self, namespace: Option<&str>) -> anyhow::Result<Vec<ServiceRecord>> {
        let path = match namespace {
            Some(ns) => format!("/api/v1/namespaces/{}/services", ns),
            None => "/api/v1/services".to_string(),
        };
        let list: ObjectList<ServiceItem> = self.get_json(&path).await?;
        Ok(list.items.into_iter().map(Self::service_from_item).collect())
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeRecord>> {
        let list: ObjectList<NodeItem> = self.get_json("/api/v1/nodes").await?;
        Ok(list.items.into_iter().map(Self::node_from_item).collect())
    }
}

fn normalize_server(server: String) -> String {
    server.trim_end_matches('/').to_string()
}

fn clamp_port(n: i64) -> u16 {
    if (1..=65535).contains(&n) {
        n as u16
    } else {
        0
    }
}

fn default_kubeconfig_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".kube").join("config"))
}

// Wire format: the slices of the Kubernetes API payloads we read. Unknown
// fields are ignored.

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize, Default)]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ServiceItem {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceSpec {
    #[serde(default, rename = "type")]
    service_type: String,
    #[serde(default, rename = "clusterIP")]
    cluster_ip: String,
    #[serde(default)]
    ports: Vec<PortSpec>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PortSpec {
    #[serde(default)]
    name: String,
    #[serde(default)]
    node_port: i64,
    #[serde(default)]
    target_port: Option<IntOrString>,
}

/// `targetPort` is an int or a named port; named ports cannot be dialed
/// directly and resolve to 0.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

impl IntOrString {
    fn as_port(&self) -> u16 {
        match self {
            IntOrString::Int(n) => clamp_port(*n),
            IntOrString::Str(_) => 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize, Default)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddressSpec>,
}

#[derive(Debug, Deserialize)]
struct NodeAddressSpec {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

// Kubeconfig: the bearer-token subset.

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default, rename = "current-context")]
    current_context: String,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(default, rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(default, rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: bool,
}

impl ClusterEntry {
    fn ca_pem(&self) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(data) = &self.certificate_authority_data {
            let pem = BASE64
                .decode(data.trim())
                .context("certificate-authority-data is not valid base64")?;
            return Ok(Some(pem));
        }
        if let Some(path) = &self.certificate_authority {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read certificate authority {}", path))?;
            return Ok(Some(pem));
        }
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Deserialize, Default)]
struct UserEntry {
    #[serde(default)]
    token: Option<String>,
}
