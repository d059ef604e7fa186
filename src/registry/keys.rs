//! Key layout inside the two store buckets.
//!
//! ```text
//! schemas bucket:
//!   subjects/<subject>/versions/<version>   JSON-encoded Schema
//!   schemas/<id>                            JSON-encoded Schema
//! config bucket:
//!   config/global                           ASCII compatibility level
//!   config/subjects/<subject>               ASCII compatibility level
//! ```

pub(crate) const SUBJECTS_PREFIX: &str = "subjects/";
pub(crate) const SCHEMAS_PREFIX: &str = "schemas/";
pub(crate) const GLOBAL_CONFIG_KEY: &str = "config/global";
pub(crate) const SUBJECT_CONFIG_PREFIX: &str = "config/subjects/";

/// High-water mark of the ID allocator. Lives outside the two data prefixes
/// so scans and the watch loop ignore it; it only ever increases, keeping
/// allocated IDs monotonic even after every schema entry has been deleted.
pub(crate) const ALLOCATOR_KEY: &str = "allocator/max_id";

/// Scope name for the global compatibility setting.
pub const GLOBAL_SCOPE: &str = "global";

const VERSIONS_INFIX: &str = "/versions/";

pub(crate) fn schema_key(id: i32) -> String {
    format!("{SCHEMAS_PREFIX}{id}")
}

pub(crate) fn version_key(subject: &str, version: i32) -> String {
    format!("{SUBJECTS_PREFIX}{subject}{VERSIONS_INFIX}{version}")
}

pub(crate) fn version_prefix(subject: &str) -> String {
    format!("{SUBJECTS_PREFIX}{subject}{VERSIONS_INFIX}")
}

pub(crate) fn subject_config_key(subject: &str) -> String {
    format!("{SUBJECT_CONFIG_PREFIX}{subject}")
}

pub(crate) fn parse_schema_key(key: &str) -> Option<i32> {
    key.strip_prefix(SCHEMAS_PREFIX)?.parse().ok()
}

pub(crate) fn parse_version_key(key: &str) -> Option<(&str, i32)> {
    let rest = key.strip_prefix(SUBJECTS_PREFIX)?;
    let at = rest.rfind(VERSIONS_INFIX)?;
    let subject = &rest[..at];
    let version = rest[at + VERSIONS_INFIX.len()..].parse().ok()?;
    Some((subject, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_key_round_trip() {
        let key = version_key("orders-value", 12);
        assert_eq!(key, "subjects/orders-value/versions/12");
        assert_eq!(parse_version_key(&key), Some(("orders-value", 12)));
    }

    #[test]
    fn schema_key_round_trip() {
        let key = schema_key(42);
        assert_eq!(key, "schemas/42");
        assert_eq!(parse_schema_key(&key), Some(42));
    }

    #[test]
    fn parse_rejects_foreign_keys() {
        assert_eq!(parse_schema_key("subjects/a/versions/1"), None);
        assert_eq!(parse_version_key("schemas/1"), None);
        assert_eq!(parse_version_key("subjects/a/versions/latest"), None);
    }
}
