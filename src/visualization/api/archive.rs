// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the gantry-control project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Archived scans endpoints

use log::error;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{get, State};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::archive::{ArchiveData, ArchiveError, ArchiveFile, ArchiveIndex};

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveListing {
    pub files: Vec<ArchiveFile>,
}

impl From<ArchiveError> for ApiError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::InvalidFilename(_) => {
                ApiError::new(Status::BadRequest, "Invalid filename format")
            }
            ArchiveError::NotFound(_) => ApiError::new(Status::NotFound, "File not found"),
            ArchiveError::Io { .. } => {
                error!("{}", err);
                ApiError::new(Status::InternalServerError, "Failed to read file")
            }
        }
    }
}

/// List archived scans, most recent first
#[get("/data/historical")]
pub fn list_archives(archive: &State<ArchiveIndex>) -> Result<Json<ArchiveListing>, ApiError> {
    match archive.list() {
        Ok(files) => Ok(Json(ArchiveListing { files })),
        Err(err) => {
            error!("{}", err);
            Err(ApiError::new(
                Status::InternalServerError,
                "Failed to read data directory",
            ))
        }
    }
}

/// Read the samples of one archived scan
#[get("/data/historical/<filename>")]
pub fn read_archive(
    filename: &str,
    archive: &State<ArchiveIndex>,
) -> Result<Json<ArchiveData>, ApiError> {
    Ok(Json(archive.read(filename)?))
}
