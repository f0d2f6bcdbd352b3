//! Wire forms of the proxy's request, response and error values.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{ProxyError, ProxyErrorKind, ProxyRequest};

/// Serde adapter storing bytes as standard base64 text.
pub(crate) mod base64_bytes {
    use super::*;

    pub fn serialize<S: serde::Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BASE64
            .decode(raw.trim())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Inbound envelope as callers send it.
///
/// The body travels either base64-encoded in `content` or verbatim in
/// `body`; `nocache` is accepted for `bypass_cache`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyRequestEnvelope {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, alias = "target")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Checked against the deployment's tag; never selects other rows.
    #[serde(default, alias = "staging")]
    pub environment: Option<String>,
    #[serde(default, alias = "nocache")]
    pub bypass_cache: bool,
}

impl ProxyRequestEnvelope {
    pub fn into_request(self) -> Result<ProxyRequest, ProxyError> {
        let body = match (self.content, self.body) {
            (Some(content), _) => BASE64
                .decode(content.trim())
                .map(Bytes::from)
                .map_err(|err| ProxyError::MalformedRequest {
                    reason: format!("content is not valid base64: {err}"),
                })?,
            (None, Some(raw)) => Bytes::from(raw),
            (None, None) => Bytes::new(),
        };
        let target = self
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ProxyError::MalformedRequest {
                reason: "missing url".to_string(),
            })?;

        Ok(ProxyRequest {
            user: self.user.unwrap_or_default(),
            project: self.project.unwrap_or_default(),
            model: self.model,
            method: self.method.unwrap_or_else(|| "POST".to_string()),
            target,
            body,
            headers: self.headers,
            environment: self.environment,
            bypass_cache: self.bypass_cache,
        })
    }
}

/// `{error_kind, message}` plus whatever fields the kind carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl From<&ProxyError> for ErrorEnvelope {
    fn from(err: &ProxyError) -> Self {
        let mut envelope = ErrorEnvelope {
            error_kind: err.kind().as_str().to_string(),
            message: err.to_string(),
            user: None,
            project: None,
            model: None,
            status_code: None,
            body: None,
        };
        match err {
            ProxyError::ProjectUnconfigured { project }
            | ProxyError::ProjectQuotaExceeded { project } => {
                envelope.project = Some(project.clone());
            }
            ProxyError::ModelQuotaExceeded { project, model } => {
                envelope.project = Some(project.clone());
                envelope.model = Some(model.clone());
            }
            ProxyError::UserQuotaExceeded {
                user,
                project,
                model,
            } => {
                envelope.user = Some(user.clone());
                envelope.project = Some(project.clone());
                envelope.model = Some(model.clone());
            }
            ProxyError::UpstreamError { status, body } => {
                envelope.status_code = Some(*status);
                envelope.body = Some(body.clone());
            }
            ProxyError::UpstreamUnavailable { .. }
            | ProxyError::MalformedRequest { .. }
            | ProxyError::LedgerUnavailable { .. } => {}
        }
        envelope
    }
}

impl ErrorEnvelope {
    /// Rebuilds the typed error on the caller's side of the boundary.
    ///
    /// Returns `None` for a tag this build does not know.
    pub fn into_error(self) -> Option<ProxyError> {
        let kind: ProxyErrorKind = self.error_kind.parse().ok()?;
        let field = |value: Option<String>| value.unwrap_or_default();
        Some(match kind {
            ProxyErrorKind::ProjectUnconfigured => ProxyError::ProjectUnconfigured {
                project: field(self.project),
            },
            ProxyErrorKind::ProjectQuotaExceeded => ProxyError::ProjectQuotaExceeded {
                project: field(self.project),
            },
            ProxyErrorKind::ModelQuotaExceeded => ProxyError::ModelQuotaExceeded {
                project: field(self.project),
                model: field(self.model),
            },
            ProxyErrorKind::UserQuotaExceeded => ProxyError::UserQuotaExceeded {
                user: field(self.user),
                project: field(self.project),
                model: field(self.model),
            },
            ProxyErrorKind::UpstreamUnavailable => ProxyError::UpstreamUnavailable {
                message: self.message,
            },
            ProxyErrorKind::UpstreamError => ProxyError::UpstreamError {
                status: self.status_code.unwrap_or(502),
                body: field(self.body),
            },
            ProxyErrorKind::MalformedRequest => ProxyError::MalformedRequest {
                reason: self.message,
            },
            ProxyErrorKind::LedgerUnavailable => ProxyError::LedgerUnavailable {
                message: self.message,
            },
        })
    }
}
