//! `Xen:<uuid>` instance identifiers.

use crate::error::{ProviderError, Result};

const PREFIX: &str = "Xen:";

/// Build the instance ID for a backend object UUID.
pub fn format(uuid: &str) -> String {
    format!("{}{}", PREFIX, uuid)
}

/// Extract the backend UUID from an instance ID.
///
/// Anything after a `\` or `/` separator (per-device suffixes) is ignored.
pub fn system_name_from_id(id: &str) -> Result<&str> {
    let rest = id
        .strip_prefix(PREFIX)
        .ok_or_else(|| ProviderError::InvalidParameter(format!("malformed instance ID '{}'", id)))?;
    let name = rest.split(['\\', '/']).next().unwrap_or_default();
    if name.is_empty() {
        return Err(ProviderError::InvalidParameter(format!(
            "instance ID '{}' has no system name",
            id
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(system_name_from_id("Xen:1234-abcd").unwrap(), "1234-abcd");
        assert_eq!(system_name_from_id("Xen:1234\\0").unwrap(), "1234");
        assert_eq!(system_name_from_id(&format("42")).unwrap(), "42");
    }

    #[test]
    fn test_malformed() {
        for bad in ["", "Xen:", "1234", "xen:1234", "Xen:\\0"] {
            assert!(
                matches!(system_name_from_id(bad), Err(ProviderError::InvalidParameter(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
