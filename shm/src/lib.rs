// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Named-object directory standing in for the shared-memory allocator.
//!
//! The manager publishes rings, pools, and tables here under the canonical
//! names from `config::names`; NFs attach by looking the same names up. The
//! allocator that maps these objects across process boundaries is an external
//! collaborator; behind the names everything is an [`Arc`].

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Longest accepted object name, matching the underlying allocator's limit.
pub const MAX_NAME_LENGTH: usize = 127;

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("object {0:?} already exists")]
    AlreadyExists(String),
    #[error("cannot find required object {0:?}")]
    NotFound(String),
    #[error("object {0:?} exists with a different type")]
    WrongType(String),
    #[error("illegal object name {0:?} (ASCII alphanumerics plus -, _, . only, max {MAX_NAME_LENGTH} chars)")]
    IllegalName(String),
}

fn validate(name: &str) -> Result<(), ShmError> {
    let legal = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if name.is_empty() || name.len() > MAX_NAME_LENGTH || !legal {
        return Err(ShmError::IllegalName(name.to_string()));
    }
    Ok(())
}

/// A directory of shared objects, keyed by name.
#[derive(Default)]
pub struct Shm {
    objects: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Shm {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `object` under `name`.
    ///
    /// # Errors
    ///
    /// Fails if the name is illegal or already taken.
    pub fn publish<T: Send + Sync + 'static>(
        &self,
        name: &str,
        object: Arc<T>,
    ) -> Result<(), ShmError> {
        validate(name)?;
        let mut objects = self.objects.write();
        if objects.contains_key(name) {
            return Err(ShmError::AlreadyExists(name.to_string()));
        }
        objects.insert(name.to_string(), object);
        Ok(())
    }

    /// Look up the object published under `name`.
    ///
    /// # Errors
    ///
    /// Fails if nothing is published under `name` or the published object has
    /// a different type. Startup code treats either as fatal.
    pub fn lookup<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, ShmError> {
        let objects = self.objects.read();
        let object = objects
            .get(name)
            .ok_or_else(|| ShmError::NotFound(name.to_string()))?;
        Arc::clone(object)
            .downcast::<T>()
            .map_err(|_| ShmError::WrongType(name.to_string()))
    }

    /// Remove the object published under `name`, if any.
    pub fn retract(&self, name: &str) {
        self.objects.write().remove(name);
    }
}
