//! Store location strings.
//!
//! A store location follows the `scheme:protocol:location[;options]` grammar.
//! The protocol selects the storage backing: `mem` (named in-memory store),
//! `file` (on-disk store), `zip` (read-only archival store). Any other
//! protocol token denotes a remote target, which this component refuses to
//! manage. Inline `user=`/`password=` options are stripped at parse time; the
//! explicit principal/credential configuration fields are authoritative.

use crate::{StoreError, StoreResult};
use std::fmt;
use std::path::PathBuf;

/// Storage backing selected by the protocol segment of a location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProtocol {
    /// Named in-memory store, shared by all pooled connections.
    Memory,
    /// File-backed store.
    File,
    /// Read-only archival store.
    Zip,
    /// Anything else. Never opened by this component.
    Remote(String),
}

/// Parsed store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    scheme: String,
    protocol: StorageProtocol,
    target: String,
    options: Vec<String>,
}

impl StoreLocation {
    /// Parse a `scheme:protocol:location[;options]` string.
    ///
    /// Only the grammar is checked here; target rules (no remote protocols,
    /// no anonymous in-memory stores) are enforced by
    /// [`StoreLocation::validate_local_target`] so that callers can report
    /// them as configuration failures.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let mut segments = raw.trim().split(';');
        let head = segments.next().unwrap_or_default();

        // Inline credentials in the location string are ignored in favor of
        // the explicit principal/credential configuration fields.
        let options: Vec<String> = segments
            .map(|opt| opt.trim().to_string())
            .filter(|opt| {
                let lower = opt.to_ascii_lowercase();
                !opt.is_empty() && !lower.starts_with("user=") && !lower.starts_with("password=")
            })
            .collect();

        let mut parts = head.splitn(3, ':');
        let scheme = parts.next().unwrap_or_default().trim().to_string();
        let protocol_token = parts.next().map(str::trim).unwrap_or_default();
        let target = parts.next().unwrap_or_default().trim().to_string();

        if scheme.is_empty() || protocol_token.is_empty() {
            return Err(StoreError::Configuration(format!(
                "location '{raw}' does not follow the scheme:protocol:location grammar"
            )));
        }

        let protocol = match protocol_token.to_ascii_lowercase().as_str() {
            "mem" => StorageProtocol::Memory,
            "file" => StorageProtocol::File,
            "zip" => StorageProtocol::Zip,
            other => StorageProtocol::Remote(other.to_string()),
        };

        Ok(Self {
            scheme,
            protocol,
            target,
            options,
        })
    }

    /// Reject targets this component must not manage.
    pub fn validate_local_target(&self) -> StoreResult<()> {
        match &self.protocol {
            StorageProtocol::Remote(protocol) => Err(StoreError::Configuration(format!(
                "remote protocol '{protocol}' is not supported, only local stores can back the message store"
            ))),
            StorageProtocol::Memory if self.target.is_empty() => Err(StoreError::Configuration(
                "anonymous in-memory stores are not supported, the store needs a name".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Canonical form used as the ownership-registry key.
    ///
    /// Scheme and options do not participate: two locations naming the same
    /// protocol and target identify the same store instance.
    pub fn canonical(&self) -> String {
        let protocol = match &self.protocol {
            StorageProtocol::Memory => "mem",
            StorageProtocol::File => "file",
            StorageProtocol::Zip => "zip",
            StorageProtocol::Remote(p) => p.as_str(),
        };
        format!("{protocol}:{}", self.target)
    }

    /// Connection string handed to the engine client.
    pub fn connection_uri(&self) -> String {
        match &self.protocol {
            StorageProtocol::Memory => {
                format!("file:{}?mode=memory&cache=shared", self.target)
            }
            StorageProtocol::File => self.target.clone(),
            StorageProtocol::Zip => format!("file:{}?immutable=1", self.target),
            StorageProtocol::Remote(_) => self.target.clone(),
        }
    }

    pub fn protocol(&self) -> &StorageProtocol {
        &self.protocol
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// True for stores whose files this component may delete and recreate.
    pub fn is_file_backed(&self) -> bool {
        matches!(self.protocol, StorageProtocol::File)
    }

    /// Filesystem path of the database file for file-backed stores.
    pub fn database_path(&self) -> Option<PathBuf> {
        if self.is_file_backed() {
            Some(PathBuf::from(&self.target))
        } else {
            None
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
