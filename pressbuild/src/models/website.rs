//! Website models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::WebsiteStatus;
use crate::errors::ProvisionError;
use crate::models::progress::PhaseProgress;

/// How to reach a customer's hosting server.
///
/// The credential itself never lives here, only a reference the
/// [`CredentialResolver`](crate::authn::credentials::CredentialResolver)
/// understands.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Hostname or IP address
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Remote login user
    pub username: String,

    /// Opaque reference to the stored credential
    pub credential_ref: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl ConnectionDescriptor {
    /// Reject descriptors that cannot possibly open a session
    pub fn validate(&self) -> Result<(), ProvisionError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ProvisionError::InvalidDescriptor("host is empty".to_string()));
        }
        if host.starts_with('-') || host.chars().any(|c| c.is_whitespace() || c == '@') {
            return Err(ProvisionError::InvalidDescriptor(
                "host contains invalid characters".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ProvisionError::InvalidDescriptor("port must be non-zero".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor("username is empty".to_string()));
        }
        if self.username.starts_with('-') || self.username.chars().any(|c| c.is_whitespace()) {
            return Err(ProvisionError::InvalidDescriptor(
                "username contains invalid characters".to_string(),
            ));
        }
        if self.credential_ref.trim().is_empty() {
            return Err(ProvisionError::InvalidDescriptor(
                "credential reference is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether commands run as root without `sudo`
    pub fn is_root(&self) -> bool {
        self.username == "root"
    }
}

// Connection details must never reach the logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &"<redacted>")
            .field("port", &self.port)
            .field("username", &"<redacted>")
            .field("credential_ref", &"<redacted>")
            .finish()
    }
}

/// Longest accepted caller-supplied website ID
const MAX_WEBSITE_ID_LEN: usize = 64;

/// Website IDs name store files, so only `[A-Za-z0-9_-]` is accepted
pub fn validate_website_id(id: &str) -> Result<(), ProvisionError> {
    if id.is_empty() || id.len() > MAX_WEBSITE_ID_LEN {
        return Err(ProvisionError::InvalidWebsite(format!(
            "id must be 1 to {} characters",
            MAX_WEBSITE_ID_LEN
        )));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ProvisionError::InvalidWebsite(
            "id may only contain letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// Lowercase and check a public domain name
pub fn normalize_domain(domain: &str) -> Result<String, ProvisionError> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || domain.len() > 253 {
        return Err(ProvisionError::InvalidWebsite("domain length is invalid".to_string()));
    }
    let labels_ok = domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok || !domain.contains('.') {
        return Err(ProvisionError::InvalidWebsite(format!("'{}' is not a domain name", domain)));
    }
    Ok(domain)
}

/// Result of the read-only detection probe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// A WordPress installation was found
    pub installed: bool,

    /// Installed WordPress version
    pub version: Option<String>,

    /// Document root containing the installation
    pub docroot: Option<String>,

    /// Path to `wp-config.php`
    pub config_path: Option<String>,

    /// Detected web server binary (`nginx`, `apache2`)
    pub web_server: Option<String>,

    /// Detected PHP version
    pub php_version: Option<String>,

    /// Diagnostic notes from checks that could not complete
    #[serde(default)]
    pub notes: Vec<String>,

    /// When the probe ran
    pub checked_at: Option<DateTime<Utc>>,
}

/// Lease held by the worker currently running a website's provisioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    /// Unique ID of the run holding the lease
    pub run_id: String,

    /// Worker process that owns the run
    pub worker: String,

    /// Lease is void after this instant unless renewed
    pub expires_at: DateTime<Utc>,
}

impl RunLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A provisioned website as persisted in the progress store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Website {
    /// Unique website ID
    pub id: String,

    /// Owner user ID
    pub owner_id: String,

    /// Public domain name
    pub domain: String,

    /// Connection descriptor, never projected into status responses
    pub connection: ConnectionDescriptor,

    /// Lifecycle status
    #[serde(default)]
    pub status: WebsiteStatus,

    /// Build phase progress
    #[serde(default)]
    pub build_progress: PhaseProgress,

    /// Certificate phase progress
    #[serde(default)]
    pub ssl_progress: PhaseProgress,

    /// Sanitized error of the last failed phase
    #[serde(default)]
    pub error_message: Option<String>,

    /// Cached detection result from the latest run
    #[serde(default)]
    pub detection: Option<DetectionResult>,

    /// Active run lease
    #[serde(default)]
    pub lease: Option<RunLease>,

    /// Store version, bumped by every compare-and-set
    #[serde(default)]
    pub version: u64,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Website {
    /// Create a freshly registered website in `pending`
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        domain: impl Into<String>,
        connection: ConnectionDescriptor,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            domain: domain.into(),
            connection,
            status: WebsiteStatus::Pending,
            build_progress: PhaseProgress::default(),
            ssl_progress: PhaseProgress::default(),
            error_message: None,
            detection: None,
            lease: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Read-only projection handed to status pollers
    pub fn status_view(&self) -> StatusView {
        StatusView {
            status: self.status.clone(),
            build_progress: self.build_progress.clone(),
            ssl_progress: self.ssl_progress.clone(),
            error_message: self.error_message.clone(),
        }
    }

    /// Whether a live lease from another run blocks a new start
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|lease| !lease.is_expired(now))
    }
}

/// What the polling endpoint returns for a website
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub status: WebsiteStatus,
    pub build_progress: PhaseProgress,
    pub ssl_progress: PhaseProgress,
    pub error_message: Option<String>,
}

/// Registration payload for a new website
#[derive(Debug, Clone, Deserialize)]
pub struct NewWebsite {
    /// Website ID; generated when absent
    pub id: Option<String>,
    pub owner_id: String,
    pub domain: String,
    pub connection: ConnectionDescriptor,
}
