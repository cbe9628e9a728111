//! On-disk app store: one directory per app holding exactly one extracted version,
//! `<root>/<appId>/<etag>`.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use miniapp_core::integrity;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("archive digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("unsafe path segment {0:?}")]
    UnsafeName(String),
    #[error("archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// An installed version found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledVersion {
    pub app_id: String,
    pub etag: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FsAppStore {
    root: PathBuf,
}

impl FsAppStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, app_id: &str, etag: &str) -> PathBuf {
        self.root.join(app_id).join(etag)
    }

    /// Verify (when a digest is given) and extract `archive`, replacing any other version of the app.
    pub fn install(
        &self,
        app_id: &str,
        etag: &str,
        archive: &[u8],
        sha256: Option<&str>,
    ) -> Result<PathBuf, InstallError> {
        check_name(app_id)?;
        check_name(etag)?;
        if let Some(expected) = sha256 {
            if !integrity::verify_archive(archive, expected) {
                return Err(InstallError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: hex::encode(integrity::hash_archive(archive)),
                });
            }
        }

        let app_dir = self.root.join(app_id);
        fs::create_dir_all(&app_dir)?;
        let staging = app_dir.join(format!(".{etag}.partial"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        if let Err(e) = extract_zip(archive, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = app_dir.join(etag);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;

        for entry in fs::read_dir(&app_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy() == etag || !entry.file_type()?.is_dir() {
                continue;
            }
            debug!(%app_id, old = %name.to_string_lossy(), "removing previous version");
            if let Err(e) = fs::remove_dir_all(entry.path()) {
                warn!(%app_id, error = %e, "could not remove previous version");
            }
        }
        info!(%app_id, %etag, path = %target.display(), "archive extracted");
        Ok(target)
    }

    /// Installed versions under the root. Hidden and partial directories are skipped.
    pub fn installed(&self) -> io::Result<Vec<InstalledVersion>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for app in fs::read_dir(&self.root)? {
            let app = app?;
            if !app.file_type()?.is_dir() {
                continue;
            }
            let app_id = app.file_name().to_string_lossy().into_owned();
            if app_id.starts_with('.') {
                continue;
            }
            for version in fs::read_dir(app.path())? {
                let version = version?;
                let etag = version.file_name().to_string_lossy().into_owned();
                if etag.starts_with('.') || !version.file_type()?.is_dir() {
                    continue;
                }
                out.push(InstalledVersion {
                    app_id: app_id.clone(),
                    etag,
                    path: version.path(),
                });
            }
        }
        out.sort_by(|a, b| (&a.app_id, &a.etag).cmp(&(&b.app_id, &b.etag)));
        Ok(out)
    }

    pub fn remove(&self, app_id: &str) -> Result<bool, InstallError> {
        check_name(app_id)?;
        let dir = self.root.join(app_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }
}

fn check_name(s: &str) -> Result<(), InstallError> {
    if s.is_empty() || s == "." || s == ".." || s.contains(['/', '\\']) {
        return Err(InstallError::UnsafeName(s.to_string()));
    }
    Ok(())
}

fn extract_zip(data: &[u8], dest: &Path) -> Result<(), InstallError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    fs::create_dir_all(dest)?;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let Some(rel) = file.enclosed_name() else {
            warn!(name = %file.name(), "skipping archive entry outside the install dir");
            continue;
        };
        let out = dest.join(rel);
        if file.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::File::create(&out)?;
        io::copy(&mut file, &mut f)?;
    }
    Ok(())
}
