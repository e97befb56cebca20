//! Authentication fallback chain.
//!
//! Maintains an ordered list of credentials in preference order (OAuth,
//! then api-key, then enterprise-key, then the marketplace key) and
//! exposes the first healthy one as "active". Failures stamp the
//! credential for five minutes; [`AuthChain::sweep`] clears expired
//! stamps and must run at the top of every request so that selection and
//! sweeping observe the same snapshot. When every credential is stamped,
//! `active()` returns the first entry anyway and lets the driver retry
//! optimistically.

use crate::config::RelayConfig;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a failure stamp stays in effect.
pub const FAILURE_STAMP_TTL: Duration = Duration::from_secs(5 * 60);

/// The auth method a credential represents, also used to express model gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    OAuth,
    ApiKey,
    EnterpriseKey,
    MarketplaceKey,
}

impl AuthMethod {
    /// Human-readable label, stable across releases.
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::OAuth => "oauth",
            AuthMethod::ApiKey => "api-key",
            AuthMethod::EnterpriseKey => "enterprise-key",
            AuthMethod::MarketplaceKey => "marketplace-key",
        }
    }

    /// Whether this method satisfies a model's auth gate.
    ///
    /// An [`AuthMethod::ApiKey`] gate accepts either keyed method, since
    /// enterprise keys are a superset of plain API keys.
    pub fn satisfies(&self, gate: Option<AuthMethod>) -> bool {
        match gate {
            None => true,
            Some(AuthMethod::ApiKey) => {
                matches!(self, AuthMethod::ApiKey | AuthMethod::EnterpriseKey)
            }
            Some(required) => *self == required,
        }
    }
}

/// One credential variant. Secret material never appears in `Debug` or
/// `Display` output; see [`mask_secret`].
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Personal OAuth login held by the external user agent; free tier.
    OAuth,
    /// Plain API key.
    ApiKey { key: String },
    /// Enterprise key with project and location.
    EnterpriseKey {
        key: String,
        project: String,
        location: String,
    },
    /// Key for the external HTTP aggregator marketplace.
    MarketplaceKey { key: String },
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::OAuth => AuthMethod::OAuth,
            Credential::ApiKey { .. } => AuthMethod::ApiKey,
            Credential::EnterpriseKey { .. } => AuthMethod::EnterpriseKey,
            Credential::MarketplaceKey { .. } => AuthMethod::MarketplaceKey,
        }
    }

    pub fn label(&self) -> &'static str {
        self.method().label()
    }

    /// True when usage under this credential accrues no monetary cost.
    pub fn is_free(&self) -> bool {
        matches!(self, Credential::OAuth)
    }

    /// The secret to hand to the transport layer, when one exists.
    pub fn secret(&self) -> Option<&str> {
        match self {
            Credential::OAuth => None,
            Credential::ApiKey { key }
            | Credential::EnterpriseKey { key, .. }
            | Credential::MarketplaceKey { key } => Some(key),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::OAuth => write!(f, "Credential::OAuth"),
            Credential::ApiKey { key } => {
                write!(f, "Credential::ApiKey({})", mask_secret(key))
            }
            Credential::EnterpriseKey { key, project, .. } => {
                write!(
                    f,
                    "Credential::EnterpriseKey({}, project={})",
                    mask_secret(key),
                    project
                )
            }
            Credential::MarketplaceKey { key } => {
                write!(f, "Credential::MarketplaceKey({})", mask_secret(key))
            }
        }
    }
}

/// Mask a credential-shaped string for logs and error context: keeps the
/// first and last four characters of long secrets, hides short ones fully.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() > 12 {
        format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
    } else {
        "***".to_string()
    }
}

#[derive(Debug, Clone)]
struct FailureStamp {
    at: Instant,
    reason: String,
}

#[derive(Debug, Clone)]
struct ChainEntry {
    credential: Credential,
    failure: Option<FailureStamp>,
}

impl ChainEntry {
    fn is_healthy(&self, now: Instant) -> bool {
        match &self.failure {
            None => true,
            Some(stamp) => now.duration_since(stamp.at) >= FAILURE_STAMP_TTL,
        }
    }
}

/// Ordered credential chain with per-credential failure memory.
#[derive(Debug)]
pub struct AuthChain {
    entries: Vec<ChainEntry>,
}

impl AuthChain {
    /// Build a chain from explicit credentials, kept in the given order.
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            entries: credentials
                .into_iter()
                .map(|credential| ChainEntry {
                    credential,
                    failure: None,
                })
                .collect(),
        }
    }

    /// Build the chain from configuration, in preference order: OAuth is
    /// always present (the external user agent owns the login), then any
    /// keys the environment supplies.
    pub fn from_config(config: &RelayConfig) -> Self {
        let mut credentials = vec![Credential::OAuth];

        if let Some(key) = &config.api_key {
            credentials.push(Credential::ApiKey { key: key.clone() });
        }
        if let (Some(key), Some(project), Some(location)) = (
            &config.enterprise_key,
            &config.enterprise_project,
            &config.enterprise_location,
        ) {
            credentials.push(Credential::EnterpriseKey {
                key: key.clone(),
                project: project.clone(),
                location: location.clone(),
            });
        }
        if let Some(key) = &config.marketplace_key {
            credentials.push(Credential::MarketplaceKey { key: key.clone() });
        }

        Self::new(credentials)
    }

    /// Number of credentials in the chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first credential with no unexpired failure stamp. When all are
    /// stamped, returns the first entry anyway so the driver can retry
    /// optimistically rather than fail without trying.
    pub fn active(&self) -> Option<Credential> {
        let now = Instant::now();
        self.entries
            .iter()
            .find(|e| e.is_healthy(now))
            .or_else(|| self.entries.first())
            .map(|e| e.credential.clone())
    }

    /// Stamp a credential with the current time and a short reason.
    pub fn record_failure(&mut self, credential: &Credential, reason: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.credential.method() == credential.method())
        {
            warn!(
                auth = credential.label(),
                reason, "credential marked failed"
            );
            entry.failure = Some(FailureStamp {
                at: Instant::now(),
                reason: reason.to_string(),
            });
        }
    }

    /// Clear failure stamps older than [`FAILURE_STAMP_TTL`]. Called at the
    /// top of every request.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        for entry in &mut self.entries {
            if let Some(stamp) = &entry.failure {
                if now.duration_since(stamp.at) >= FAILURE_STAMP_TTL {
                    debug!(auth = entry.credential.label(), "failure stamp expired");
                    entry.failure = None;
                }
            }
        }
    }

    /// The next healthy credential after `failed` in preference order, if any.
    pub fn next(&self, failed: &Credential) -> Option<Credential> {
        let now = Instant::now();
        let failed_idx = self
            .entries
            .iter()
            .position(|e| e.credential.method() == failed.method())?;
        self.entries
            .iter()
            .skip(failed_idx + 1)
            .find(|e| e.is_healthy(now))
            .map(|e| e.credential.clone())
    }

    /// One line per stamped credential, for the aggregated auth error.
    pub fn failure_report(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.failure
                    .as_ref()
                    .map(|stamp| format!("{}: {}", e.credential.label(), stamp.reason))
            })
            .collect()
    }
}
