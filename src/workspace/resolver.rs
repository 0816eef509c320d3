//! Resolution of abstract code/data references into local paths.
//!
//! The engine only depends on the [`ReferenceResolver`] trait. The bundled
//! [`StandardResolver`] understands plain local paths, `file://` URLs and
//! `http(s)://` URLs, which are downloaded into the destination directory.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("reference {reference:?} cannot be resolved: {reason}")]
    Unresolvable { reference: String, reason: String },

    #[error("reference {0:?} uses an unsupported scheme")]
    UnsupportedScheme(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Maps a reference string to a path on local storage.
///
/// Implementations may fetch or materialize content under `destination`
/// as a side effect. The directory may not exist yet, and callers hand out a
/// fresh one per reference. The returned future must be `Send` so resolution can
/// happen on the engine's worker tasks.
pub trait ReferenceResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        reference: &str,
        destination: &Path,
    ) -> impl Future<Output = Result<PathBuf, ResolveError>> + Send;

    /// Resolve a reference naming a location artifacts are published to.
    ///
    /// Defaults to treating the reference as a local directory, created on demand.
    fn resolve_output(
        &self,
        reference: &str,
    ) -> impl Future<Output = Result<PathBuf, ResolveError>> + Send {
        let target = match classify(reference) {
            Reference::Local(path) => absolute(reference, path),
            _ => Err(ResolveError::UnsupportedScheme(reference.to_string())),
        };
        async move {
            let dir = target?;
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| ResolveError::Io {
                    path: dir.clone(),
                    source,
                })?;
            Ok(dir)
        }
    }
}

enum Reference<'a> {
    Local(&'a Path),
    Http(&'a str),
    Other,
}

fn classify(reference: &str) -> Reference<'_> {
    if let Some(rest) = reference.strip_prefix("file://") {
        return Reference::Local(Path::new(rest));
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Reference::Http(reference);
    }
    if reference.contains("://") {
        return Reference::Other;
    }
    Reference::Local(Path::new(reference))
}

fn absolute(reference: &str, path: &Path) -> Result<PathBuf, ResolveError> {
    std::path::absolute(path).map_err(|e| ResolveError::Unresolvable {
        reference: reference.to_string(),
        reason: e.to_string(),
    })
}

/// Resolver for local paths, `file://` and `http(s)://` references.
pub struct StandardResolver {
    http: Client,
}

impl StandardResolver {
    pub fn new() -> Result<Self, ResolveError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http })
    }

    async fn download(&self, url: &str, destination: &Path) -> Result<PathBuf, ResolveError> {
        let parsed = Url::parse(url).map_err(|e| ResolveError::Unresolvable {
            reference: url.to_string(),
            reason: e.to_string(),
        })?;
        let file_name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
            .unwrap_or("download")
            .to_string();

        let response = self.http.get(parsed).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ResolveError::Unresolvable {
                reference: url.to_string(),
                reason: format!("server returned status {}", status.as_u16()),
            });
        }
        let body = response.bytes().await?;

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|source| ResolveError::Io {
                path: destination.to_path_buf(),
                source,
            })?;
        let target = destination.join(file_name);
        tokio::fs::write(&target, &body)
            .await
            .map_err(|source| ResolveError::Io {
                path: target.clone(),
                source,
            })?;
        info!(url, path = %target.display(), bytes = body.len(), "downloaded reference");
        Ok(target)
    }
}

impl ReferenceResolver for StandardResolver {
    async fn resolve(&self, reference: &str, destination: &Path) -> Result<PathBuf, ResolveError> {
        match classify(reference) {
            Reference::Local(path) => {
                let path = absolute(reference, path)?;
                if !path.exists() {
                    return Err(ResolveError::Unresolvable {
                        reference: reference.to_string(),
                        reason: format!("{} does not exist", path.display()),
                    });
                }
                debug!(reference, path = %path.display(), "resolved local reference");
                Ok(path)
            }
            Reference::Http(url) => self.download(url, destination).await,
            Reference::Other => Err(ResolveError::UnsupportedScheme(reference.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn local_reference_resolves_to_absolute_existing_path() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join("train.csv");
        std::fs::write(&file, "a,b\n").unwrap();

        let resolver = StandardResolver::new().unwrap();
        let resolved = resolver
            .resolve(file.to_str().unwrap(), tmp.path())
            .await
            .unwrap();
        assert_eq!(resolved, file);

        let via_url = format!("file://{}", file.display());
        let resolved = resolver.resolve(&via_url, tmp.path()).await.unwrap();
        assert_eq!(resolved, file);
    }

    #[tokio::test]
    async fn missing_local_reference_is_unresolvable() {
        let tmp = tempdir().unwrap();
        let missing = tmp.path().join("nope.csv");
        let resolver = StandardResolver::new().unwrap();
        let err = resolver
            .resolve(missing.to_str().unwrap(), tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable { .. }));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let tmp = tempdir().unwrap();
        let resolver = StandardResolver::new().unwrap();
        let err = resolver
            .resolve("s3://bucket/key", tmp.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn http_reference_is_downloaded_into_destination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/datasets/train.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x,y\n1,2\n"))
            .mount(&server)
            .await;

        let tmp = tempdir().unwrap();
        let resolver = StandardResolver::new().unwrap();
        let url = format!("{}/datasets/train.csv", server.uri());
        let resolved = resolver.resolve(&url, tmp.path()).await.unwrap();

        assert_eq!(resolved, tmp.path().join("train.csv"));
        assert_eq!(std::fs::read_to_string(resolved).unwrap(), "x,y\n1,2\n");
    }

    #[tokio::test]
    async fn http_error_status_is_unresolvable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let tmp = tempdir().unwrap();
        let resolver = StandardResolver::new().unwrap();
        let url = format!("{}/missing.csv", server.uri());
        let err = resolver.resolve(&url, tmp.path()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable { .. }));
    }

    #[tokio::test]
    async fn output_reference_defaults_to_local_directory() {
        let tmp = tempdir().unwrap();
        let target = tmp.path().join("published/run-1");
        let resolver = StandardResolver::new().unwrap();
        let dir = resolver
            .resolve_output(target.to_str().unwrap())
            .await
            .unwrap();
        assert!(dir.is_dir());

        let err = resolver.resolve_output("s3://bucket/out").await.unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedScheme(_)));
    }
}
