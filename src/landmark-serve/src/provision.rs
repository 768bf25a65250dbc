//! Makes sure model artifacts exist on local storage before anything loads them.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use reqwest::header::CONTENT_TYPE;

use crate::error::{Error, Result};
use crate::Timer;

const GDRIVE_DOWNLOAD: &str = "https://drive.usercontent.google.com/download";

/// Where an artifact can be fetched from when it is missing locally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArtifactSource {
    Url(String),
    /// Google Drive file id, downloaded through the public export endpoint.
    GoogleDrive(String),
}

impl ArtifactSource {
    /// Parse an optional locator, treating a blank one as unset.
    pub fn optional(locator: Option<&str>) -> std::result::Result<Option<Self>, String> {
        locator
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .transpose()
    }

    pub fn url(&self) -> String {
        match self {
            ArtifactSource::Url(url) => url.clone(),
            ArtifactSource::GoogleDrive(id) => {
                format!("{}?id={}&export=download&confirm=t", GDRIVE_DOWNLOAD, id)
            }
        }
    }
}

fn is_drive_id(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FromStr for ArtifactSource {
    type Err = String;

    fn from_str(locator: &str) -> std::result::Result<Self, Self::Err> {
        let locator = locator.trim();

        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Ok(ArtifactSource::Url(locator.to_owned()));
        }

        let id = locator.strip_prefix("gdrive:").unwrap_or(locator);
        if is_drive_id(id) {
            Ok(ArtifactSource::GoogleDrive(id.to_owned()))
        } else {
            Err(format!(
                "'{}' is neither an http(s) URL nor a Google Drive id",
                locator
            ))
        }
    }
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Url(url) => f.write_str(url),
            ArtifactSource::GoogleDrive(id) => write!(f, "gdrive:{}", id),
        }
    }
}

/// A file the service needs, plus where to get it.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub source: Option<ArtifactSource>,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, source: Option<ArtifactSource>) -> Self {
        Artifact {
            path: path.into(),
            source,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Guarantee that `artifact.path` holds the artifact.
///
/// An existing path (file or directory) is left alone. A missing one is
/// downloaded from the configured source without retries.
pub fn ensure_present(artifact: &Artifact) -> Result<&Path> {
    let path = artifact.path.as_path();

    if path.exists() {
        debug!("{} already present", path.display());
        return Ok(path);
    }

    let source = artifact
        .source
        .as_ref()
        .ok_or_else(|| Error::Config {
            path: path.to_path_buf(),
        })?;

    let url = source.url();
    info!("Downloading {} from {}", path.display(), source);

    let mut t = Timer::new_start(&format!("Fetching {}", path.display()));
    let written = download(&url, path)?;
    t.stop();

    info!("{} download complete ({} bytes)", path.display(), written);

    Ok(path)
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn download(url: &str, path: &Path) -> Result<u64> {
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .build()
        .map_err(|e| Error::fetch(url, e))?;

    let mut resp = client.get(url).send().map_err(|e| Error::fetch(url, e))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(Error::fetch(url, format!("server answered {}", status)));
    }

    let html = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("text/html"));
    if html {
        return Err(Error::fetch(
            url,
            "server answered with an HTML page instead of the artifact",
        ));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            Error::fetch(url, format!("could not create {}: {}", parent.display(), e))
        })?;
    }

    let part = partial_path(path);
    write_artifact(&mut resp, &part, path).map_err(|message| {
        if let Err(rm) = fs::remove_file(&part) {
            if rm.kind() != io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", part.display(), rm);
            }
        }
        Error::fetch(url, message)
    })
}

/// Stream the body into `part`, then move it over `path`.
fn write_artifact(
    resp: &mut reqwest::blocking::Response,
    part: &Path,
    path: &Path,
) -> std::result::Result<u64, String> {
    let mut file = File::create(part)
        .map_err(|e| format!("could not create {}: {}", part.display(), e))?;

    let written = resp.copy_to(&mut file).map_err(|e| e.to_string())?;

    file.sync_all()
        .map_err(|e| format!("could not flush {}: {}", part.display(), e))?;
    drop(file);

    fs::rename(part, path)
        .map_err(|e| format!("could not move {} into place: {}", part.display(), e))?;

    Ok(written)
}
