//! Parsing `/v2/<name>/...` request paths
//!
//! Repository names contain slashes, so paths are matched from the end.

use crate::digest::Digest;
use crate::error::RegistryResult;
use crate::name::{RepositoryName, validate_tag};

/// A manifest reference: a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            Ok(Reference::Digest(reference.parse()?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_owned()))
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    Blob { name: RepositoryName, digest: Digest },
    Uploads { name: RepositoryName },
    Upload { name: RepositoryName, id: String },
    Manifest { name: RepositoryName, reference: Reference },
    Tags { name: RepositoryName },
    Housekeeping { name: Option<RepositoryName> },
}

impl Route {
    /// Parse the part of the path after `/v2/`. `Ok(None)` means no route.
    pub(crate) fn parse(path: &str) -> RegistryResult<Option<Self>> {
        let path = path.trim_start_matches('/');

        if path == "_housekeeping" {
            return Ok(Some(Route::Housekeeping { name: None }));
        }
        if let Some(name) = path.strip_suffix("/_housekeeping") {
            return Ok(Some(Route::Housekeeping {
                name: Some(RepositoryName::new(name)?),
            }));
        }
        if let Some(name) = path.strip_suffix("/tags/list") {
            return Ok(Some(Route::Tags {
                name: RepositoryName::new(name)?,
            }));
        }
        if let Some(name) = path
            .strip_suffix("/blobs/uploads/")
            .or_else(|| path.strip_suffix("/blobs/uploads"))
        {
            return Ok(Some(Route::Uploads {
                name: RepositoryName::new(name)?,
            }));
        }

        let Some((rest, last)) = path.rsplit_once('/') else {
            return Ok(None);
        };
        if last.is_empty() {
            return Ok(None);
        }

        if let Some(name) = rest.strip_suffix("/blobs/uploads") {
            return Ok(Some(Route::Upload {
                name: RepositoryName::new(name)?,
                id: last.to_owned(),
            }));
        }
        if let Some(name) = rest.strip_suffix("/blobs") {
            return Ok(Some(Route::Blob {
                name: RepositoryName::new(name)?,
                digest: last.parse()?,
            }));
        }
        if let Some(name) = rest.strip_suffix("/manifests") {
            return Ok(Some(Route::Manifest {
                name: RepositoryName::new(name)?,
                reference: Reference::parse(last)?,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::RegistryError;

    fn name(name: &str) -> RepositoryName {
        RepositoryName::new(name).unwrap()
    }

    #[test]
    fn nested_names() {
        let digest = Digest::from_bytes(b"x");
        assert_eq!(
            Route::parse(&format!("library/app/blobs/{digest}")).unwrap(),
            Some(Route::Blob {
                name: name("library/app"),
                digest: digest.clone(),
            })
        );
        assert_eq!(
            Route::parse("a/b/c/manifests/latest").unwrap(),
            Some(Route::Manifest {
                name: name("a/b/c"),
                reference: Reference::Tag("latest".into()),
            })
        );
        assert_eq!(
            Route::parse(&format!("app/manifests/{digest}")).unwrap(),
            Some(Route::Manifest {
                name: name("app"),
                reference: Reference::Digest(digest),
            })
        );
    }

    #[test]
    fn uploads_and_tags() {
        assert_eq!(
            Route::parse("app/blobs/uploads/").unwrap(),
            Some(Route::Uploads { name: name("app") })
        );
        assert_eq!(
            Route::parse("app/blobs/uploads/abc").unwrap(),
            Some(Route::Upload {
                name: name("app"),
                id: "abc".into(),
            })
        );
        assert_eq!(
            Route::parse("org/app/tags/list").unwrap(),
            Some(Route::Tags { name: name("org/app") })
        );
    }

    #[test]
    fn housekeeping() {
        assert_eq!(
            Route::parse("_housekeeping").unwrap(),
            Some(Route::Housekeeping { name: None })
        );
        assert_eq!(
            Route::parse("org/app/_housekeeping").unwrap(),
            Some(Route::Housekeeping {
                name: Some(name("org/app")),
            })
        );
    }

    #[test]
    fn rejects() {
        assert_eq!(Route::parse("app/unknown/thing").unwrap(), None);
        assert_eq!(Route::parse("app/blobs/").unwrap(), None);
        assert!(matches!(
            Route::parse("App/tags/list"),
            Err(RegistryError::NameInvalid(_))
        ));
        assert!(matches!(
            Route::parse("app/blobs/sha256:short"),
            Err(RegistryError::DigestInvalid(_))
        ));
    }
}
