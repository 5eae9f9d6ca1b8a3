/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Compression support for backups
//!
//! Artifacts are plain zip archives so they stay readable with standard tools
//! when no password is configured.

use crate::{
    error::{BackupError, Result},
    wallet::SourceFile,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use tracing::debug;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const EMPTY_ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// Compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub level: CompressionLevel,
}

/// Compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionLevel {
    Fast,
    Balanced,
    Best,
    Custom(i32),
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            level: CompressionLevel::Balanced,
        }
    }
}

impl CompressionLevel {
    /// Deflate level
    pub fn to_level(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 6,
            CompressionLevel::Best => 9,
            CompressionLevel::Custom(level) => (*level).clamp(0, 9),
        }
    }
}

/// Zip archive transform.
#[derive(Debug, Clone)]
pub struct ZipCompression {
    level: i32,
}

impl ZipCompression {
    pub const EXTENSION: &'static str = "zip";
    pub const MIME_TYPE: &'static str = "application/zip";

    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            level: config.level.to_level(),
        }
    }

    pub fn extension(&self) -> &'static str {
        Self::EXTENSION
    }

    pub fn mime_type(&self) -> &'static str {
        Self::MIME_TYPE
    }

    /// Write `files` into a new archive at `output`, returning the number of
    /// uncompressed bytes stored.
    pub fn compress(&self, files: &[SourceFile], output: &Path) -> Result<u64> {
        let mut zip = ZipWriter::new(BufWriter::new(File::create(output)?));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.level));

        let mut total = 0u64;
        for file in files {
            zip.start_file(file.archive_name.as_str(), options)?;
            let mut input = BufReader::new(File::open(&file.path).map_err(|e| {
                BackupError::BuildInterrupted(format!("{}: {}", file.path.display(), e))
            })?);
            total += io::copy(&mut input, &mut zip)?;
        }

        zip.finish()?.flush()?;
        debug!(
            "Compressed {} files ({} bytes) into {}",
            files.len(),
            total,
            output.display()
        );
        Ok(total)
    }

    /// Extract `archive` below `destination`, returning the relative paths of
    /// the extracted files.
    ///
    /// Entries that would escape `destination` are rejected as tampering.
    pub fn decompress(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(archive)?))?;
        fs::create_dir_all(destination)?;

        let mut extracted = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let relative = match entry.enclosed_name() {
                Some(path) => path.to_path_buf(),
                None => {
                    return Err(BackupError::StorageTampered(format!(
                        "Archive entry escapes the target directory: {}",
                        entry.name()
                    )))
                }
            };

            let target = destination.join(&relative);
            if entry.is_dir() {
                fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut output = BufWriter::new(File::create(&target)?);
            io::copy(&mut entry, &mut output)?;
            output.flush()?;
            extracted.push(relative);
        }

        debug!("Extracted {} files into {}", extracted.len(), destination.display());
        Ok(extracted)
    }
}

/// Whether the file starts with a zip local-file or end-of-directory header.
pub fn is_zip_file(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(magic == ZIP_MAGIC || magic == EMPTY_ZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, data: &[u8]) -> SourceFile {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        SourceFile {
            path,
            archive_name: name.to_string(),
        }
    }

    #[test]
    fn test_compress_and_extract() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let files = vec![
            write(source.path(), "wallet.sqlite", &vec![7u8; 200_000]),
            write(source.path(), "config/passphrase", b"secret words"),
        ];

        let codec = ZipCompression::new(&CompressionConfig::default());
        let archive = source.path().join("out.zip");
        let stored = codec.compress(&files, &archive).unwrap();
        assert_eq!(stored, 200_000 + 12);
        assert!(is_zip_file(&archive).unwrap());
        assert!(fs::metadata(&archive).unwrap().len() < 200_000);

        let mut extracted = codec.decompress(&archive, target.path()).unwrap();
        extracted.sort();
        assert_eq!(
            extracted,
            vec![PathBuf::from("config/passphrase"), PathBuf::from("wallet.sqlite")]
        );
        assert_eq!(
            fs::read(target.path().join("config/passphrase")).unwrap(),
            b"secret words"
        );
        assert_eq!(fs::read(target.path().join("wallet.sqlite")).unwrap(), vec![7u8; 200_000]);
    }

    #[test]
    fn test_missing_source_interrupts() {
        let dir = TempDir::new().unwrap();
        let codec = ZipCompression::new(&CompressionConfig::default());
        let files = vec![SourceFile {
            path: dir.path().join("absent"),
            archive_name: "absent".to_string(),
        }];

        let result = codec.compress(&files, &dir.path().join("out.zip"));
        assert!(matches!(result, Err(BackupError::BuildInterrupted(_))));
    }

    #[test]
    fn test_escaping_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        {
            let mut zip = ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("../escaped.txt", FileOptions::default()).unwrap();
            zip.write_all(b"nope").unwrap();
            zip.finish().unwrap();
        }

        let target = dir.path().join("target");
        let codec = ZipCompression::new(&CompressionConfig::default());
        let result = codec.decompress(&archive, &target);
        assert!(matches!(result, Err(BackupError::StorageTampered(_))));
        assert!(!dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_garbage_is_not_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage");
        fs::write(&path, b"definitely not an archive").unwrap();
        assert!(!is_zip_file(&path).unwrap());

        let codec = ZipCompression::new(&CompressionConfig::default());
        assert!(matches!(
            codec.decompress(&path, &dir.path().join("out")),
            Err(BackupError::Compression(_))
        ));
    }

    #[test]
    fn test_custom_level_is_clamped() {
        assert_eq!(CompressionLevel::Custom(42).to_level(), 9);
        assert_eq!(CompressionLevel::Fast.to_level(), 1);
    }
}
