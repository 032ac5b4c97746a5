// Copyright (C) 2025 The Sentinel Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wallet directory validation and archive extraction tests.

use std::io::Write;

use base64::prelude::*;
use sentinel_core::wallet::{self, WalletError, WalletSource};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

fn wallet_zip(entries: &[(&str, &[u8], CompressionMethod)]) -> String {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        for (name, contents, method) in entries {
            let options = SimpleFileOptions::default().compression_method(*method);
            writer.start_file(name.to_string(), options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }
    BASE64_STANDARD.encode(cursor.into_inner())
}

#[test]
fn test_directory_source_requires_sso() {
    let dir = tempfile::tempdir().unwrap();
    let source = WalletSource::Directory(dir.path().to_path_buf());
    assert!(matches!(
        wallet::prepare(&source),
        Err(WalletError::MissingFile("cwallet.sso"))
    ));

    std::fs::write(dir.path().join("cwallet.sso"), b"sso").unwrap();
    let prepared = wallet::prepare(&source).unwrap();
    assert_eq!(prepared, dir.path());
}

#[test]
fn test_missing_directory_rejected() {
    let source = WalletSource::Directory("/does/not/exist".into());
    assert!(matches!(
        wallet::prepare(&source),
        Err(WalletError::NotADirectory(_))
    ));
}

#[test]
fn test_archive_extraction_stored_and_deflated() {
    let encoded = wallet_zip(&[
        ("cwallet.sso", b"sso-bytes", CompressionMethod::Stored),
        ("tnsnames.ora", b"sentinel_high = (DESCRIPTION=...)", CompressionMethod::Deflated),
        ("sqlnet.ora", b"SSL_SERVER_DN_MATCH=yes", CompressionMethod::Deflated),
    ]);

    let dir = wallet::prepare(&WalletSource::Base64(encoded)).unwrap();
    assert!(dir.join("cwallet.sso").is_file());
    assert_eq!(
        std::fs::read(dir.join("cwallet.sso")).unwrap(),
        b"sso-bytes"
    );
    assert!(dir.join("tnsnames.ora").is_file());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.join("cwallet.sso"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "wallet files must be 0600");
    }

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_archive_entry_paths_are_flattened() {
    // Entries packed under subdirectories (or with traversal attempts)
    // land as plain file names in the target directory.
    let encoded = wallet_zip(&[(
        "wallet/inner/cwallet.sso",
        b"sso".as_slice(),
        CompressionMethod::Stored,
    )]);

    let dir = wallet::prepare(&WalletSource::Base64(encoded)).unwrap();
    assert!(dir.join("cwallet.sso").is_file());
    assert!(!dir.join("wallet").exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_archive_without_sso_rejected() {
    let encoded = wallet_zip(&[("tnsnames.ora", b"x".as_slice(), CompressionMethod::Stored)]);
    assert!(matches!(
        wallet::prepare(&WalletSource::Base64(encoded)),
        Err(WalletError::MissingFile("cwallet.sso"))
    ));
}

#[test]
fn test_invalid_base64_rejected() {
    assert!(matches!(
        wallet::prepare(&WalletSource::Base64("not base64!!!".to_string())),
        Err(WalletError::Decode(_))
    ));
}

#[test]
fn test_whitespace_in_base64_tolerated() {
    let encoded = wallet_zip(&[("cwallet.sso", b"sso".as_slice(), CompressionMethod::Stored)]);
    let wrapped: String = encoded
        .as_bytes()
        .chunks(40)
        .map(|chunk| format!("{}\n", std::str::from_utf8(chunk).unwrap()))
        .collect();

    let dir = wallet::prepare(&WalletSource::Base64(wrapped)).unwrap();
    assert!(dir.join("cwallet.sso").is_file());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_garbage_archive_rejected() {
    let encoded = BASE64_STANDARD.encode(b"this is not a zip archive");
    assert!(matches!(
        wallet::prepare(&WalletSource::Base64(encoded)),
        Err(WalletError::Archive(_))
    ));
}
