// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Oracle wallet handling.
//!
//! The wallet is a directory holding the TLS identity (`cwallet.sso`, and
//! usually `ewallet.p12`, `tnsnames.ora`, `sqlnet.ora`). Deployments either
//! mount it as a directory or inject it as a base64-encoded ZIP archive;
//! the archive form is extracted to a unique directory with files created
//! mode 0600 before the driver sees it.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::prelude::*;
use chrono::Utc;
use tracing::{debug, info};
use zip::CompressionMethod;

/// Auto-login credential store the driver requires.
pub const WALLET_SSO_FILE: &str = "cwallet.sso";

/// Where the wallet comes from.
#[derive(Debug, Clone)]
pub enum WalletSource {
    /// A directory already on disk.
    Directory(PathBuf),
    /// A base64-encoded ZIP archive of the wallet files.
    Base64(String),
}

/// Wallet preparation failures. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("wallet location {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("wallet is missing {0}")]
    MissingFile(&'static str),
    #[error("wallet archive is not valid base64: {0}")]
    Decode(String),
    #[error("wallet archive is not a valid ZIP: {0}")]
    Archive(String),
    #[error("wallet archive entry {name} uses unsupported compression {method}")]
    UnsupportedCompression { name: String, method: String },
    #[error("wallet archive entry {0} has an unsafe path")]
    UnsafeEntryPath(String),
    #[error("wallet io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate or materialize the wallet and return the directory the driver
/// should use.
pub fn prepare(source: &WalletSource) -> Result<PathBuf, WalletError> {
    match source {
        WalletSource::Directory(dir) => {
            validate_dir(dir)?;
            debug!(dir = %dir.display(), "using mounted wallet directory");
            Ok(dir.clone())
        }
        WalletSource::Base64(encoded) => {
            let dir = extraction_dir();
            extract_archive(encoded, &dir)?;
            validate_dir(&dir)?;
            info!(dir = %dir.display(), "wallet archive extracted");
            Ok(dir)
        }
    }
}

fn validate_dir(dir: &Path) -> Result<(), WalletError> {
    if !dir.is_dir() {
        return Err(WalletError::NotADirectory(dir.to_path_buf()));
    }
    if !dir.join(WALLET_SSO_FILE).is_file() {
        return Err(WalletError::MissingFile(WALLET_SSO_FILE));
    }
    Ok(())
}

/// Unique per-process extraction directory (pod restarts never collide).
fn extraction_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "sentinel-wallet-{}-{}",
        std::process::id(),
        Utc::now().format("%Y%m%d%H%M%S%f")
    ))
}

/// Decode and unpack the archive. Only `stored` and `deflate` entries are
/// accepted; entry paths are flattened to their file names so a crafted
/// archive cannot escape the target directory.
fn extract_archive(encoded: &str, target: &Path) -> Result<(), WalletError> {
    let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64_STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| WalletError::Decode(e.to_string()))?;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| WalletError::Archive(e.to_string()))?;

    fs::create_dir_all(target)?;
    set_mode(target, 0o700)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| WalletError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        match entry.compression() {
            CompressionMethod::Stored | CompressionMethod::Deflated => {}
            other => {
                return Err(WalletError::UnsupportedCompression {
                    name: entry.name().to_string(),
                    method: format!("{other:?}"),
                })
            }
        }

        let name = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|f| f.to_owned()))
            .ok_or_else(|| WalletError::UnsafeEntryPath(entry.name().to_string()))?;

        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;

        let path = target.join(name);
        fs::write(&path, &contents)?;
        set_mode(&path, 0o600)?;
    }

    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), WalletError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), WalletError> {
    Ok(())
}
