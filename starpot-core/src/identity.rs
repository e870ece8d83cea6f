//! Anonymous participant identities.
//!
//! The lottery treats an identity as an opaque, session-stable string. The
//! default provider mirrors anonymous sign-in: reuse what this device already
//! has, mint a fresh one otherwise.

use crate::error::{Result, StarpotError};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const IDENTITY_ENV: &str = "STARPOT_IDENTITY";
const IDENTITY_FILE: &str = "identity";

pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Result<String>;
}

/// Fixed identity, for simulations and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_identity(&self) -> Result<String> {
        validate(&self.0)
    }
}

/// Identity from `STARPOT_IDENTITY`, else from an identity file in the data
/// directory, minting and persisting a UUID on first use.
#[derive(Debug, Clone)]
pub struct AnonymousIdentity {
    path: PathBuf,
}

impl AnonymousIdentity {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(IDENTITY_FILE),
        }
    }

    fn load_or_create(&self) -> Result<String> {
        if let Ok(id) = std::env::var(IDENTITY_ENV) {
            return validate(id.trim());
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) => validate(contents.trim()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let id = Uuid::new_v4().to_string();
                std::fs::write(&self.path, &id)?;
                tracing::info!("Created anonymous identity {}", id);
                Ok(id)
            }
            Err(e) => Err(StarpotError::identity(format!(
                "cannot read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl IdentityProvider for AnonymousIdentity {
    fn current_identity(&self) -> Result<String> {
        self.load_or_create()
    }
}

fn validate(id: &str) -> Result<String> {
    if id.is_empty() {
        return Err(StarpotError::identity("identity is empty"));
    }
    if id.contains('/') {
        return Err(StarpotError::identity(format!(
            "identity '{}' contains '/'",
            id
        )));
    }
    Ok(id.to_string())
}
