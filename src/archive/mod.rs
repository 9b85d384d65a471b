// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Scan archive index
//!
//! Completed scans are stored by the data collector as newline-delimited JSON
//! files named `gantry_scan_YYYYMMDD_HHMMSS.json`, one sample per line. This
//! module lists them and reads them back. Archives are never written here.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::acquisition::line_decoder::sample_from_object;
use crate::acquisition::TelemetrySample;
use crate::config::GridConfig;

/// Errors returned by the archive index.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Invalid filename format")]
    InvalidFilename(String),

    #[error("Archive not found: {0}")]
    NotFound(String),

    #[error("Failed to access archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Description of an archived scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub filename: String,
    /// Creation time, or modification time where the filesystem does not
    /// record creation.
    pub created: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Content of an archived scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveData {
    pub filename: String,
    pub total_points: usize,
    pub scan_data: Vec<TelemetrySample>,
}

fn filename_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(gantry_)?scan_\d{8}_\d{6}\.json$").expect("archive filename pattern is valid")
    })
}

/// Whether `filename` is an acceptable archive name.
pub fn is_valid_filename(filename: &str) -> bool {
    filename_pattern().is_match(filename)
}

/// Read-only index over an archive directory.
#[derive(Debug, Clone)]
pub struct ArchiveIndex {
    directory: PathBuf,
    grid: GridConfig,
}

impl ArchiveIndex {
    pub fn new<P: AsRef<Path>>(directory: P, grid: GridConfig) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            grid,
        }
    }

    /// List the archives, most recent first.
    pub fn list(&self) -> Result<Vec<ArchiveFile>, ArchiveError> {
        let entries = fs::read_dir(&self.directory).map_err(|source| ArchiveError::Io {
            path: self.directory.clone(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Skipping unreadable archive entry: {}", err);
                    continue;
                }
            };
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !is_valid_filename(&filename) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(err) => {
                    warn!("Cannot stat archive {}: {}", filename, err);
                    continue;
                }
            };
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(ArchiveFile {
                filename,
                created: DateTime::<Utc>::from(created),
                size: metadata.len(),
            });
        }

        files.sort_by(|a, b| {
            b.created
                .cmp(&a.created)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        debug!("Found {} archive(s) in {:?}", files.len(), self.directory);
        Ok(files)
    }

    /// Read the samples of an archive, in file order.
    ///
    /// The name is checked before any filesystem access. Lines that are not
    /// JSON objects with numeric `x`, `y` and `z` are skipped.
    pub fn read(&self, filename: &str) -> Result<ArchiveData, ArchiveError> {
        if !is_valid_filename(filename) {
            return Err(ArchiveError::InvalidFilename(filename.to_string()));
        }

        let path = self.directory.join(filename);
        let contents = fs::read_to_string(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ArchiveError::NotFound(filename.to_string()),
            _ => ArchiveError::Io {
                path: path.clone(),
                source,
            },
        })?;

        let loaded_at = Utc::now();
        let mut skipped = 0usize;
        let scan_data: Vec<TelemetrySample> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| {
                let sample = match serde_json::from_str::<Value>(line) {
                    Ok(Value::Object(map)) => sample_from_object(&map, &self.grid, loaded_at),
                    _ => None,
                };
                if sample.is_none() {
                    skipped += 1;
                }
                sample
            })
            .collect();

        if skipped > 0 {
            debug!("Skipped {} invalid line(s) in {}", skipped, filename);
        }

        Ok(ArchiveData {
            filename: filename.to_string(),
            total_points: scan_data.len(),
            scan_data,
        })
    }
}
