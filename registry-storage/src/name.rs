//! Repository and tag names

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{RegistryError, RegistryResult};

/// Longest repository name accepted, including separators.
pub const NAME_TOTAL_LENGTH_MAX: usize = 255;

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$")
        .expect("repository name pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern"));

/// A validated repository name, e.g. `library/ubuntu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Validate a repository name.
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        let name = name.into();
        if name.len() > NAME_TOTAL_LENGTH_MAX || !NAME.is_match(&name) {
            return Err(RegistryError::NameInvalid(name));
        }
        Ok(Self(name))
    }

    /// The name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RepositoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validate a tag name.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    if !TAG.is_match(tag) {
        return Err(RegistryError::TagInvalid(tag.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_names() {
        for good in ["a", "library/ubuntu", "my-org/my_app.v2", "a__b/c--d"] {
            assert!(RepositoryName::new(good).is_ok(), "{good} should be valid");
        }

        for bad in ["", "Upper", "a//b", "/a", "a/", "a..b", "-a", "a b"] {
            assert!(
                matches!(RepositoryName::new(bad), Err(RegistryError::NameInvalid(_))),
                "{bad:?} should be invalid"
            );
        }

        let long = "a".repeat(NAME_TOTAL_LENGTH_MAX + 1);
        assert!(RepositoryName::new(long).is_err());
    }

    #[test]
    fn tags() {
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("v1.0.0-rc_1").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag("").is_err());
        assert!(validate_tag(&"t".repeat(129)).is_err());
        assert!(validate_tag("has/slash").is_err());
    }
}
