//! Filesystem artifact storage.
//!
//! Page artifacts live at `<root>/<key>.html` and `<root>/<key>.gz`;
//! consolidated stylesheets at `<root>/css/optimized_<fingerprint>.css`.
//! Every write lands in a temporary file in the destination directory and is
//! renamed into place, so readers only ever see complete files.

use std::{
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use super::keys::{CacheKey, is_fingerprint};

const SOURCE: &str = "cache::store";
const STYLESHEET_DIR: &str = "css";
const STYLESHEET_PREFIX: &str = "optimized_";
const STYLESHEET_SUFFIX: &str = ".css";
const INDEX_MARKER: &str = "index.html";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to prepare cache directory `{path}`: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write artifact `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove artifact `{path}`: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read artifact `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which artifact of a page pair to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Html,
    Gzip,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Html => "html",
            ArtifactKind::Gzip => "gz",
        }
    }
}

/// Map a key to its artifact location under `root`.
///
/// Keys are hex fingerprints, so the result never leaves `root`.
pub fn artifact_path(root: &Path, key: &CacheKey, compressed: bool) -> PathBuf {
    let kind = if compressed {
        ArtifactKind::Gzip
    } else {
        ArtifactKind::Html
    };
    root.join(format!("{}.{}", key.as_str(), kind.extension()))
}

/// Outcome of a content-addressed stylesheet write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StylesheetArtifact {
    pub file_name: String,
    pub path: PathBuf,
    pub created: bool,
}

/// Filesystem-backed artifact store rooted at a single cache directory.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Prepare the cache root (and its stylesheet directory) and mark it
    /// non-browsable with an empty index document.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let stylesheets = root.join(STYLESHEET_DIR);
        fs::create_dir_all(&stylesheets).map_err(|source| StoreError::Setup {
            path: stylesheets.clone(),
            source,
        })?;

        for dir in [&root, &stylesheets] {
            let marker = dir.join(INDEX_MARKER);
            if !marker.exists() {
                fs::write(&marker, b"").map_err(|source| StoreError::Setup {
                    path: marker.clone(),
                    source,
                })?;
            }
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stylesheet_dir(&self) -> PathBuf {
        self.root.join(STYLESHEET_DIR)
    }

    pub fn path(&self, key: &CacheKey, kind: ArtifactKind) -> PathBuf {
        artifact_path(&self.root, key, kind == ArtifactKind::Gzip)
    }

    /// Atomically replace the artifact of `kind` for `key`.
    pub fn write(
        &self,
        key: &CacheKey,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<PathBuf, StoreError> {
        let path = self.path(key, kind);
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Read an artifact; `Ok(None)` when it has not been written.
    pub fn read(&self, key: &CacheKey, kind: ArtifactKind) -> Result<Option<Bytes>, StoreError> {
        let path = self.path(key, kind);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read { path, source }),
        }
    }

    /// Remove both artifacts for `key`. Missing files are not an error.
    ///
    /// Returns the number of files actually deleted.
    pub fn remove(&self, key: &CacheKey) -> Result<usize, StoreError> {
        let mut removed = 0;
        for kind in [ArtifactKind::Html, ArtifactKind::Gzip] {
            if remove_if_present(&self.path(key, kind))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove every page artifact under the root. Other files are left alone.
    pub fn clear_pages(&self) -> Result<usize, StoreError> {
        self.clear_matching(&self.root, is_page_artifact)
    }

    /// Remove every consolidated stylesheet.
    pub fn clear_stylesheets(&self) -> Result<usize, StoreError> {
        self.clear_matching(&self.stylesheet_dir(), |name| {
            stylesheet_fingerprint(name).is_some()
        })
    }

    /// Persist consolidated CSS under its content fingerprint.
    ///
    /// An existing file for the same fingerprint is never rewritten.
    pub fn write_stylesheet(
        &self,
        fingerprint: &str,
        css: &str,
    ) -> Result<StylesheetArtifact, StoreError> {
        let file_name = format!("{STYLESHEET_PREFIX}{fingerprint}{STYLESHEET_SUFFIX}");
        let path = self.stylesheet_dir().join(&file_name);

        if path.exists() {
            return Ok(StylesheetArtifact {
                file_name,
                path,
                created: false,
            });
        }

        let mut file = temp_file_beside(&path)?;
        file.write_all(css.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;

        let created = match file.persist_noclobber(&path) {
            Ok(_) => true,
            // Another request persisted identical content first.
            Err(err) if err.error.kind() == ErrorKind::AlreadyExists => false,
            Err(err) => {
                return Err(StoreError::Write {
                    path,
                    source: err.error,
                });
            }
        };

        Ok(StylesheetArtifact {
            file_name,
            path,
            created,
        })
    }

    /// Resolve a public stylesheet file name to its path, rejecting anything
    /// that is not a consolidated stylesheet produced by this store.
    pub fn stylesheet_path(&self, file_name: &str) -> Option<PathBuf> {
        stylesheet_fingerprint(file_name)?;
        Some(self.stylesheet_dir().join(file_name))
    }

    fn clear_matching(
        &self,
        dir: &Path,
        matches: impl Fn(&str) -> bool,
    ) -> Result<usize, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(StoreError::Read {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if matches(name) && remove_if_present(&entry.path())? {
                removed += 1;
            }
        }

        debug!(
            target = SOURCE,
            op = "clear",
            dir = %dir.display(),
            removed,
            "cleared artifacts"
        );
        Ok(removed)
    }
}

fn is_page_artifact(name: &str) -> bool {
    let Some((stem, extension)) = name.rsplit_once('.') else {
        return false;
    };
    matches!(extension, "html" | "gz") && is_fingerprint(stem)
}

fn stylesheet_fingerprint(name: &str) -> Option<&str> {
    let fingerprint = name
        .strip_prefix(STYLESHEET_PREFIX)?
        .strip_suffix(STYLESHEET_SUFFIX)?;
    is_fingerprint(fingerprint).then_some(fingerprint)
}

fn temp_file_beside(path: &Path) -> Result<NamedTempFile, StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = temp_file_beside(path)?;
    file.write_all(bytes)
        .and_then(|_| file.flush())
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    file.persist(path).map_err(|err| StoreError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(StoreError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
