//! Stable per-device session identity
//!
//! The identity is a UUIDv5 derived from a device name (by default the MAC
//! address) under a fixed namespace. It is cached in a local file so the robot
//! keeps joining the same signaling room across restarts.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace under which device names are hashed
pub const IDENTITY_NAMESPACE: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_567812345678);

/// Default cache file name
pub const DEFAULT_IDENTITY_FILE: &str = "robot_id.txt";

/// Network interfaces tried, in order, when deriving the device name
const MAC_INTERFACES: [&str; 2] = ["eth0", "wlan0"];

/// Errors resolving the session identity
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("No cached identity and no device name to derive one from")]
    MissingName,

    #[error("Identity file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Opaque identifier used as the signaling room id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity(String);

impl SessionIdentity {
    /// Derive the identity for a device name
    pub fn derive(name: &str) -> Self {
        Self(Uuid::new_v5(&IDENTITY_NAMESPACE, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable storage for the identity
pub trait IdentityProvider: Send + Sync {
    /// Previously stored identity, if any
    fn load(&self) -> Result<Option<SessionIdentity>, IdentityError>;

    /// Persist a freshly derived identity
    fn save(&self, identity: &SessionIdentity) -> Result<(), IdentityError>;
}

/// Identity cached in a plain text file
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> IdentityError {
        IdentityError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl IdentityProvider for FileIdentityStore {
    fn load(&self) -> Result<Option<SessionIdentity>, IdentityError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        let id = contents.trim();
        if id.is_empty() {
            warn!("Identity file {} is empty, ignoring it", self.path.display());
            return Ok(None);
        }
        Ok(Some(SessionIdentity(id.to_string())))
    }

    fn save(&self, identity: &SessionIdentity) -> Result<(), IdentityError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }
        fs::write(&self.path, identity.as_str()).map_err(|e| self.io_error(e))
    }
}

/// In-memory identity storage
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<SessionIdentity>>,
    saves: Mutex<usize>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an identity already cached
    pub fn with_identity(identity: SessionIdentity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
            saves: Mutex::new(0),
        }
    }

    /// Number of times `save` was called
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl IdentityProvider for MemoryIdentityStore {
    fn load(&self) -> Result<Option<SessionIdentity>, IdentityError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, identity: &SessionIdentity) -> Result<(), IdentityError> {
        *self.slot.lock() = Some(identity.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

/// Resolve the robot identity.
///
/// A cached identity always wins. Otherwise the identity is derived from
/// `name` and written back to the provider.
pub fn generate_robot_id(
    provider: &dyn IdentityProvider,
    name: Option<&str>,
) -> Result<SessionIdentity, IdentityError> {
    if let Some(identity) = provider.load()? {
        info!("Using existing robot id: {}", identity);
        return Ok(identity);
    }

    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(IdentityError::MissingName)?;

    let identity = SessionIdentity::derive(name);
    provider.save(&identity)?;
    info!("Generated new robot id: {}", identity);
    Ok(identity)
}

/// Read the device MAC address under a sysfs root (normally `/sys`)
pub fn read_mac_address(sys_root: &Path) -> Option<String> {
    for interface in MAC_INTERFACES {
        let path = sys_root.join("class/net").join(interface).join("address");
        match fs::read_to_string(&path) {
            Ok(mac) => {
                let mac = mac.trim();
                if !mac.is_empty() {
                    debug!("Using MAC address of {} as device name", interface);
                    return Some(mac.to_string());
                }
            }
            Err(e) => debug!("Cannot read {}: {}", path.display(), e),
        }
    }
    None
}
