//! HTTP probe wire types.

use serde::{Deserialize, Serialize};

/// An HTTP-GET health probe.
///
/// `client_cert`, `client_key` and `ca_cert` are paths to PEM files on the
/// probed host. Zero-valued thresholds select the defaults (success 1,
/// failure 3); the prober clamps both to a minimum of 1.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Probe {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Seconds to sleep before the very first attempt after (re)application.
    pub initial_delay_seconds: i64,
    /// Per-request timeout, seconds. Zero selects the default of 1.
    pub timeout_seconds: i64,
    pub success_threshold: i32,
    pub failure_threshold: i32,
    #[serde(rename = "httpGet")]
    pub http_get: HttpGetAction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpGetAction {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// Disable TLS verification entirely.
    pub insecure: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_cert: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
}

/// Threshold-tracked probe state.
///
/// `healthy` keeps its previous value between the first sample and the
/// threshold being crossed, so the zero value reads as "not yet healthy"
/// rather than "unhealthy".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeStatus {
    pub healthy: bool,
    pub success_count: i32,
    pub failure_count: i32,
}
