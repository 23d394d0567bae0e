//! Image reference parsing and normalization.

use std::str::FromStr;

use moor_common::{MoorError, MoorResult};

/// A parsed, normalized image reference.
///
/// The canonical form is what the store uses as its index key, so different
/// spellings of the same image (`alpine`, `docker.io/library/alpine:latest`)
/// resolve to the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub tag: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse and normalize an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    ///
    /// # Errors
    ///
    /// Returns [`MoorError::InvalidReference`] when the reference is empty,
    /// the repository is not lowercase, or the tag or digest is malformed.
    pub fn parse(reference: &str) -> MoorResult<Self> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid(reference, "reference is empty"));
        }

        // Split off a digest or tag.
        let (name, tag) = if let Some(idx) = trimmed.find('@') {
            let (name, digest) = trimmed.split_at(idx);
            let digest = &digest[1..];
            validate_digest(reference, digest)?;
            // In name:tag@digest form the digest pins the image; the tag
            // part is informational only.
            let name = match name.rfind(':') {
                Some(colon) if !name[colon + 1..].contains('/') => &name[..colon],
                _ => name,
            };
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = trimmed.rfind(':') {
            // A ':' whose remainder holds a '/' is a registry port, not a tag.
            let potential_tag = &trimmed[idx + 1..];
            if potential_tag.contains('/') {
                (trimmed, default_tag(reference))
            } else {
                let (name, tag) = trimmed.split_at(idx);
                let tag = &tag[1..];
                validate_tag(reference, tag)?;
                (name, ImageTag::Tag(tag.to_string()))
            }
        } else {
            (trimmed, default_tag(reference))
        };

        // Split registry from repository.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (
                Self::DEFAULT_REGISTRY.to_string(),
                format!("library/{name}"),
            ),
        };

        validate_repository(reference, &repository)?;

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// The fully normalized reference string.
    #[must_use]
    pub fn canonical(&self) -> String {
        let tag = match &self.tag {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = MoorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

fn default_tag(reference: &str) -> ImageTag {
    tracing::debug!(
        reference,
        tag = ImageReference::DEFAULT_TAG,
        "Reference has no tag, defaulting"
    );
    ImageTag::Tag(ImageReference::DEFAULT_TAG.to_string())
}

fn invalid(reference: &str, message: &str) -> MoorError {
    MoorError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

fn validate_tag(reference: &str, tag: &str) -> MoorResult<()> {
    if tag.is_empty() || tag.len() > 128 {
        return Err(invalid(reference, "tag must be 1-128 characters"));
    }
    if !tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(
            reference,
            "tag must start with a letter, digit, or underscore",
        ));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid(reference, "tag contains invalid characters"));
    }
    Ok(())
}

fn validate_digest(reference: &str, digest: &str) -> MoorResult<()> {
    let Some((algorithm, hash)) = digest.split_once(':') else {
        return Err(invalid(reference, "digest must look like algorithm:hex"));
    };
    if algorithm.is_empty()
        || !algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(invalid(
            reference,
            "digest algorithm must be lowercase alphanumeric",
        ));
    }
    if hash.len() < 32 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(
            reference,
            "digest hash must be at least 32 hex characters",
        ));
    }
    Ok(())
}

fn validate_repository(reference: &str, repository: &str) -> MoorResult<()> {
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid(reference, "repository name must be lowercase"));
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(invalid(reference, "repository has an empty path component"));
        }
        if !component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
            return Err(invalid(
                reference,
                "repository components must start with a letter or digit",
            ));
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid(reference, "repository contains invalid characters"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let ref_ = ImageReference::parse("alpine").unwrap();
        assert_eq!(ref_.registry, "docker.io");
        assert_eq!(ref_.repository, "library/alpine");
        assert!(matches!(ref_.tag, ImageTag::Tag(t) if t == "latest"));
    }

    #[test]
    fn parse_with_tag() {
        let ref_ = ImageReference::parse("alpine:3.19").unwrap();
        assert_eq!(ref_.registry, "docker.io");
        assert_eq!(ref_.repository, "library/alpine");
        assert!(matches!(ref_.tag, ImageTag::Tag(t) if t == "3.19"));
    }

    #[test]
    fn parse_user_repo() {
        let ref_ = ImageReference::parse("myuser/myapp").unwrap();
        assert_eq!(ref_.registry, "docker.io");
        assert_eq!(ref_.repository, "myuser/myapp");
    }

    #[test]
    fn parse_custom_registry() {
        let ref_ = ImageReference::parse("ghcr.io/org/app:v1.0").unwrap();
        assert_eq!(ref_.registry, "ghcr.io");
        assert_eq!(ref_.repository, "org/app");
        assert!(matches!(ref_.tag, ImageTag::Tag(t) if t == "v1.0"));
    }

    #[test]
    fn parse_registry_with_port() {
        let ref_ = ImageReference::parse("localhost:5000/app").unwrap();
        assert_eq!(ref_.registry, "localhost:5000");
        assert_eq!(ref_.repository, "app");
        assert_eq!(ref_.canonical(), "localhost:5000/app:latest");
    }

    #[test]
    fn parse_digest() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let ref_ = ImageReference::parse(&format!("alpine@{digest}")).unwrap();
        assert_eq!(ref_.repository, "library/alpine");
        assert!(matches!(&ref_.tag, ImageTag::Digest(d) if *d == digest));
        assert_eq!(ref_.canonical(), format!("docker.io/library/alpine@{digest}"));
    }

    #[test]
    fn digest_wins_over_tag() {
        let digest = format!("sha256:{}", "cd".repeat(32));
        let ref_ = ImageReference::parse(&format!("alpine:3.19@{digest}")).unwrap();
        assert_eq!(ref_.repository, "library/alpine");
        assert!(matches!(ref_.tag, ImageTag::Digest(_)));
    }

    #[test]
    fn canonical_is_stable() {
        let spellings = [
            "alpine",
            "alpine:latest",
            "library/alpine",
            "docker.io/library/alpine:latest",
        ];
        for spelling in spellings {
            let ref_ = ImageReference::parse(spelling).unwrap();
            assert_eq!(
                ref_.canonical(),
                "docker.io/library/alpine:latest",
                "{spelling}"
            );
        }
    }

    #[test]
    fn rejects_bad_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
        assert!(ImageReference::parse("Alpine").is_err());
        assert!(ImageReference::parse("alpine:").is_err());
        assert!(ImageReference::parse("alpine:ta g").is_err());
        assert!(ImageReference::parse("alpine:-bad").is_err());
        assert!(ImageReference::parse("alpine@notadigest").is_err());
        assert!(ImageReference::parse("alpine@sha256:short").is_err());
        assert!(ImageReference::parse("docker.io//alpine").is_err());
    }

    #[test]
    fn rejected_reference_is_reported() {
        let err = ImageReference::parse("Alpine").unwrap_err();
        assert!(matches!(
            err,
            MoorError::InvalidReference { reference, .. } if reference == "Alpine"
        ));
    }
}
