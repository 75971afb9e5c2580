// SPDX-License-Identifier: MIT OR Apache-2.0
use std::io::Cursor;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Errors raised while locating or provisioning tracker binaries.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No install location contained the requested binary and none
    /// could be downloaded.
    #[error("tracker binary {name} not found and download failed: {reason}")]
    NotFound {
        /// Logical binary name that was requested.
        name: String,
        /// Reason the fallback download path failed.
        reason: String,
    },
    /// The release download failed.
    #[error("failed to download tracker release: {0}")]
    Download(#[from] reqwest::Error),
    /// The downloaded archive could not be extracted.
    #[error("failed to extract tracker release: {0}")]
    Extract(String),
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Where a tracker binary lives once resolved.
#[derive(Clone, Debug)]
pub struct ResolvedBinary {
    /// Absolute path to the executable.
    pub path: PathBuf,
}

/// Pinned upstream tracker release used by the auto-download path.
const RELEASE_VERSION: &str = "v0.13.2";
const RELEASE_BASE: &str = "https://github.com/ActivityWatch/activitywatch/releases/download";

/// Upstream (pre-rebrand) binary names paired with this agent's branded
/// component names, applied when extracting a downloaded release.
pub const UPSTREAM_TO_BRANDED: &[(&str, &str)] = &[
    ("aw-server-rust", "data_service"),
    ("aw-watcher-window", "watcher_window"),
    ("aw-watcher-afk", "watcher_afk"),
];

/// Directory-scheme platform key (`<data_dir>/trackers/<platform>/...`).
pub fn platform_key() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(windows) {
        "windows"
    } else {
        "linux"
    }
}

/// Appends the platform executable extension (`.exe` on Windows) to a
/// binary base name.
pub fn binary_file_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

/// The release archive published for the running platform, if any. Only
/// macOS and Windows releases are published upstream.
pub fn platform_release_asset() -> Option<String> {
    if cfg!(target_os = "macos") {
        Some(format!("activitywatch-{RELEASE_VERSION}-macos-x86_64.zip"))
    } else if cfg!(windows) {
        Some(format!("activitywatch-{RELEASE_VERSION}-windows.zip"))
    } else {
        None
    }
}

/// Full download URL for this platform's release asset, if published.
pub fn release_download_url() -> Option<String> {
    platform_release_asset().map(|asset| format!("{RELEASE_BASE}/{RELEASE_VERSION}/{asset}"))
}

/// [`UPSTREAM_TO_BRANDED`] with the platform executable extension
/// applied to both sides, ready to pass to
/// [`BinaryDiscovery::download_release`].
pub fn upstream_renames() -> Vec<(String, String)> {
    UPSTREAM_TO_BRANDED
        .iter()
        .map(|(upstream, branded)| (binary_file_name(upstream), binary_file_name(branded)))
        .collect()
}

/// Locates tracker binaries across install locations, falling back to
/// downloading a release archive.
///
/// Search order: persistent install dir, development-relative dir,
/// bundled-resource dir (an env-provided bundle root, for builds that
/// ship the tracker binaries alongside a packaged executable).
pub struct BinaryDiscovery {
    install_dir: PathBuf,
    dev_dir: Option<PathBuf>,
    bundle_dir: Option<PathBuf>,
}

impl BinaryDiscovery {
    /// Build a discovery helper rooted at `install_dir` (typically under
    /// the agent's data directory), with optional dev/bundle fallbacks.
    pub fn new(install_dir: PathBuf, dev_dir: Option<PathBuf>, bundle_dir: Option<PathBuf>) -> Self {
        Self { install_dir, dev_dir, bundle_dir }
    }

    fn candidate_dirs(&self) -> Vec<&Path> {
        let mut dirs = vec![self.install_dir.as_path()];
        if let Some(d) = &self.dev_dir {
            dirs.push(d.as_path());
        }
        if let Some(b) = &self.bundle_dir {
            dirs.push(b.as_path());
        }
        dirs
    }

    /// Find `binary_name` (platform-appropriate extension already
    /// applied by the caller) across every candidate directory.
    pub fn find(&self, binary_name: &str) -> Option<ResolvedBinary> {
        for dir in self.candidate_dirs() {
            let candidate = dir.join(binary_name);
            if candidate.is_file() {
                return Some(ResolvedBinary { path: candidate });
            }
        }
        None
    }

    /// Whether every binary in `names` is already present.
    pub fn all_present(&self, names: &[&str]) -> bool {
        names.iter().all(|n| self.find(n).is_some())
    }

    /// Download and extract a release zip into `install_dir`, renaming
    /// the upstream binaries per `renames` (`upstream_name ->
    /// branded_name`), stripping the macOS quarantine attribute and
    /// setting the executable bit on unix.
    pub async fn download_release(
        &self,
        download_url: &str,
        renames: &[(&str, &str)],
    ) -> Result<(), DiscoveryError> {
        info!(url = download_url, "downloading tracker release");
        let bytes = reqwest::get(download_url).await?.bytes().await?;
        std::fs::create_dir_all(&self.install_dir)?;

        let cursor = Cursor::new(bytes.to_vec());
        let mut archive = zip::ZipArchive::new(cursor).map_err(|e| DiscoveryError::Extract(e.to_string()))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| DiscoveryError::Extract(e.to_string()))?;
            let Some(entry_name) = entry.enclosed_name() else { continue };
            let Some(file_name) = entry_name.file_name().and_then(|n| n.to_str()) else { continue };

            let target_name = renames
                .iter()
                .find(|(upstream, _)| *upstream == file_name)
                .map(|(_, branded)| *branded)
                .unwrap_or(file_name);

            if entry.is_dir() {
                continue;
            }
            let out_path = self.install_dir.join(target_name);
            let mut out_file = std::fs::File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out_file)?;
            finalize_executable(&out_path)?;
        }

        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn finalize_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::process::Command::new("xattr")
        .args(["-d", "com.apple.quarantine"])
        .arg(path)
        .status();
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(all(unix, not(target_os = "macos")))]
fn finalize_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(windows)]
fn finalize_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_binary_in_install_dir() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("data_service");
        std::fs::write(&bin, b"#!/bin/sh\n").unwrap();
        let discovery = BinaryDiscovery::new(dir.path().to_path_buf(), None, None);
        let resolved = discovery.find("data_service").unwrap();
        assert_eq!(resolved.path, bin);
    }

    #[test]
    fn falls_back_to_dev_dir() {
        let install = tempfile::tempdir().unwrap();
        let dev = tempfile::tempdir().unwrap();
        std::fs::write(dev.path().join("watcher_window"), b"x").unwrap();
        let discovery = BinaryDiscovery::new(
            install.path().to_path_buf(),
            Some(dev.path().to_path_buf()),
            None,
        );
        assert!(discovery.find("watcher_window").is_some());
    }

    #[test]
    fn missing_binary_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = BinaryDiscovery::new(dir.path().to_path_buf(), None, None);
        assert!(discovery.find("nonexistent").is_none());
    }
}
