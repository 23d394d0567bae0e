//! Unique name generation for store records and mount workspaces.

/// Generate a 12-character hex suffix derived from a UUID v4.
#[must_use]
pub fn random_suffix() -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..6])
}

/// Generate a unique name with the given prefix, e.g. `moor-3f9a2c81d04e`.
#[must_use]
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", random_suffix())
}
