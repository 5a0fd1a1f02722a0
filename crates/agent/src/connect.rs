//! Remote store connection bootstrap.
//!
//! The connection-info file carries a kubeconfig blob plus the namespace and
//! name of the feedback object. Only the fields the agent needs are read out
//! of the kubeconfig: server URL, CA material, bearer token, and optional
//! client certificate pair.
//!
//! TLS bootstrap is an explicit retry policy: the first reachability attempt
//! uses the provided roots; if that fails with the "unknown authority" error
//! class while CA material is present and strict verification is off, one
//! retry is made with system roots only (the provided CA material is
//! discarded). With strict verification on, missing CA material or an
//! unknown-authority failure is fatal.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("kubeconfig could not be parsed: {0}")]
    KubeConfig(#[from] serde_yaml::Error),
    #[error("kubeconfig named no cluster server")]
    NoServer,
    #[error("kubeconfig field {field} was not valid base64: {source}")]
    Base64 {
        field: &'static str,
        source: base64::DecodeError,
    },
    #[error("CA data was empty while strict verification was enabled")]
    StrictVerifyWithoutCa,
    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),
    #[error("error while connecting to remote store: {0}")]
    Unreachable(reqwest::Error),
}

/// Contents of the connection-info file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub kube_config: String,
    pub namespace: String,
    pub secret_name: String,
}

/// A validated client for the remote store.
#[derive(Clone)]
pub struct RemoteClient {
    pub server: String,
    pub http: reqwest::Client,
}

/// The kubeconfig fields the agent consumes.
#[derive(Debug, Default)]
pub struct Credentials {
    pub server: String,
    pub ca_data: Vec<u8>,
    pub token: String,
    pub client_cert_data: Vec<u8>,
    pub client_key_data: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct KubeConfigDoc {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: ClusterEntry,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterEntry {
    #[serde(default)]
    server: String,
    #[serde(default, rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
struct UserEntry {
    #[serde(default)]
    token: String,
    #[serde(default, rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(default, rename = "client-key-data")]
    client_key_data: String,
}

/// Extract the credential fields from a kubeconfig blob.
pub fn parse_kube_config(raw: &str) -> Result<Credentials, ConnectError> {
    let doc: KubeConfigDoc = serde_yaml::from_str(raw)?;
    let cluster = doc
        .clusters
        .into_iter()
        .next()
        .map(|c| c.cluster)
        .unwrap_or_default();
    if cluster.server.is_empty() {
        return Err(ConnectError::NoServer);
    }
    let user = doc
        .users
        .into_iter()
        .next()
        .map(|u| u.user)
        .unwrap_or_default();

    let decode = |field: &'static str, value: &str| -> Result<Vec<u8>, ConnectError> {
        if value.is_empty() {
            return Ok(Vec::new());
        }
        BASE64
            .decode(value)
            .map_err(|source| ConnectError::Base64 { field, source })
    };

    Ok(Credentials {
        server: cluster.server.trim_end_matches('/').to_string(),
        ca_data: decode(
            "certificate-authority-data",
            &cluster.certificate_authority_data,
        )?,
        token: user.token,
        client_cert_data: decode("client-certificate-data", &user.client_certificate_data)?,
        client_key_data: decode("client-key-data", &user.client_key_data)?,
    })
}

/// Whether a reqwest error is the "certificate signed by unknown authority"
/// class, walking the source chain for the TLS layer's wording.
fn is_unknown_authority(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        let text = current.to_string();
        if text.contains("UnknownIssuer")
            || text.contains("unknown authority")
            || text.contains("unknown issuer")
        {
            return true;
        }
        source = current.source();
    }
    false
}

fn build_client(credentials: &Credentials, with_ca: bool) -> Result<reqwest::Client, ConnectError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(Duration::from_secs(30));

    if with_ca && !credentials.ca_data.is_empty() {
        let certificate =
            reqwest::Certificate::from_pem(&credentials.ca_data).map_err(ConnectError::Client)?;
        builder = builder.add_root_certificate(certificate);
    }
    if !credentials.client_cert_data.is_empty() && !credentials.client_key_data.is_empty() {
        let mut pem = credentials.client_key_data.clone();
        pem.extend_from_slice(&credentials.client_cert_data);
        let identity = reqwest::Identity::from_pem(&pem).map_err(ConnectError::Client)?;
        builder = builder.identity(identity);
    }
    if !credentials.token.is_empty() {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(mut value) =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {}", credentials.token))
        {
            value.set_sensitive(true);
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        builder = builder.default_headers(headers);
    }
    builder.build().map_err(ConnectError::Client)
}

/// A trivial request proving the endpoint is reachable: any HTTP response
/// counts, only transport/TLS failures do not.
async fn validate(client: &reqwest::Client, server: &str) -> Result<(), reqwest::Error> {
    client
        .get(format!("{server}/version"))
        .send()
        .await
        .map(|_| ())
}

/// Validate reachability of the remote store and produce the client the
/// store implementation will use.
pub async fn connect(
    info: &ConnectionInfo,
    strict_verify: bool,
) -> Result<RemoteClient, ConnectError> {
    let credentials = parse_kube_config(&info.kube_config)?;
    if strict_verify && credentials.ca_data.is_empty() {
        return Err(ConnectError::StrictVerifyWithoutCa);
    }

    let client = build_client(&credentials, true)?;
    match validate(&client, &credentials.server).await {
        Ok(()) => {
            debug!(server = %credentials.server, "remote store reachable");
            Ok(RemoteClient {
                server: credentials.server,
                http: client,
            })
        }
        Err(err)
            if is_unknown_authority(&err) && !credentials.ca_data.is_empty() && !strict_verify =>
        {
            info!(
                %err,
                "initial connection failed with unknown certificate authority, \
                 retrying with system roots only"
            );
            let fallback = build_client(&credentials, false)?;
            validate(&fallback, &credentials.server)
                .await
                .map_err(ConnectError::Unreachable)?;
            Ok(RemoteClient {
                server: credentials.server,
                http: fallback,
            })
        }
        Err(err) => Err(ConnectError::Unreachable(err)),
    }
}
