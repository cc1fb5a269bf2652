//! Built-in resource handlers.
//!
//! Thin mapping layers between pool records and managed-object properties.
//! Each handler serves a family of classes and is registered by
//! [`crate::Registry::with_defaults`].

pub mod computer_system;
pub mod host;
pub mod job;
pub mod migration;
pub mod services;

use crate::error::{ProviderError, Result};
use crate::types::ObjectPath;

/// Required string key of an object path, as `InvalidParameter` when missing.
pub(crate) fn required_key<'a>(path: &'a ObjectPath, key: &str) -> Result<&'a str> {
    path.key_str(key).ok_or_else(|| {
        ProviderError::InvalidParameter(format!("{} is missing key {}", path.class_name, key))
    })
}
