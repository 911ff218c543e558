//! URI-dispatched key providers.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::debug;

use super::{AuthorizedKey, KeySource, KeySourceError, parse_key_document};

const DRIVE_FILE_MARKER: &str = "drive.google.com/file/d/";

/// Where a key document lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyLocation {
    /// Local file.
    File(Utf8PathBuf),
    /// Plain HTTP(S) download.
    Http(String),
    /// Publicly readable object in an S3 bucket.
    S3 {
        /// Bucket region, for example `eu-west-1`.
        region: String,
        /// Bucket name.
        bucket: String,
        /// Object key inside the bucket.
        object: String,
    },
}

impl KeyLocation {
    /// Classifies `uri` by scheme.
    ///
    /// `s3://<region>/<bucket>/<object>` selects S3, `http(s)://` a download,
    /// `file://` or a bare path a local file.
    ///
    /// # Errors
    ///
    /// Returns [`KeySourceError::InvalidUri`] for unknown schemes or an
    /// incomplete S3 path.
    pub fn parse(uri: &str) -> Result<Self, KeySourceError> {
        let invalid = |reason: &str| KeySourceError::InvalidUri {
            uri: uri.to_owned(),
            reason: reason.to_owned(),
        };

        if let Some(rest) = uri.strip_prefix("s3://") {
            let mut parts = rest.splitn(3, '/');
            let region = parts.next().filter(|part| !part.is_empty());
            let bucket = parts.next().filter(|part| !part.is_empty());
            let object = parts.next().filter(|part| !part.is_empty());
            return match (region, bucket, object) {
                (Some(region), Some(bucket), Some(object)) => Ok(Self::S3 {
                    region: region.to_owned(),
                    bucket: bucket.to_owned(),
                    object: object.to_owned(),
                }),
                _ => Err(invalid("expected s3://<region>/<bucket>/<object>")),
            };
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Self::Http(direct_download_url(uri)));
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return Ok(Self::File(Utf8PathBuf::from(path)));
        }
        if uri.contains("://") {
            return Err(invalid("unknown scheme"));
        }
        if uri.trim().is_empty() {
            return Err(invalid("empty location"));
        }
        Ok(Self::File(Utf8PathBuf::from(uri)))
    }
}

/// Rewrites Google Drive share links to their direct-download form.
#[must_use]
pub fn direct_download_url(url: &str) -> String {
    let Some((_, after)) = url.split_once(DRIVE_FILE_MARKER) else {
        return url.to_owned();
    };
    let id = after.split(['/', '?']).next().unwrap_or_default();
    if id.is_empty() {
        return url.to_owned();
    }
    format!("https://drive.google.com/uc?export=download&id={id}")
}

/// Default [`KeySource`]: local files, HTTP(S), and S3.
#[derive(Clone, Debug)]
pub struct UriKeySource {
    client: reqwest::blocking::Client,
}

impl UriKeySource {
    /// Builds a source whose downloads time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`KeySourceError::Client`] when the TLS stack cannot start.
    pub fn new(timeout: Duration) -> Result<Self, KeySourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(KeySourceError::Client)?;
        Ok(Self { client })
    }

    fn download(&self, url: &str) -> Result<String, KeySourceError> {
        debug!(url, "downloading key document");
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| KeySourceError::Http {
                url: url.to_owned(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(KeySourceError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }
        response.text().map_err(|source| KeySourceError::Http {
            url: url.to_owned(),
            source,
        })
    }
}

/// Reads a local key document through a capability handle on its parent.
///
/// # Errors
///
/// Returns [`KeySourceError::Read`] when the file cannot be opened.
pub fn read_local(path: &Utf8Path) -> Result<String, KeySourceError> {
    let read_error = |message: String| KeySourceError::Read {
        path: path.to_string(),
        message,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))
}

impl KeySource for UriKeySource {
    fn fetch(&self, uri: &str) -> Result<Vec<AuthorizedKey>, KeySourceError> {
        let body = match KeyLocation::parse(uri)? {
            KeyLocation::File(path) => read_local(&path)?,
            KeyLocation::Http(url) => self.download(&url)?,
            KeyLocation::S3 {
                region,
                bucket,
                object,
            } => self.download(&format!(
                "https://{bucket}.s3.{region}.amazonaws.com/{object}"
            ))?,
        };
        parse_key_document(&body)
    }
}
