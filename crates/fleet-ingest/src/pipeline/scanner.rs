use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use glob::Pattern;
use log::{debug, info};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};
use crate::state::FileType;

/// A telemetry file found under a vehicle directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub file_type: FileType,
}

/// Enumerates `{base}/{organization}/{vehicle}/{TYPE}/{TYPE}_*.txt`.
pub struct VehicleScanner {
    base_path: PathBuf,
}

impl VehicleScanner {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn organization_dir(&self, organization_id: &str) -> PathBuf {
        self.base_path.join(organization_id)
    }

    pub fn vehicle_dir(&self, organization_id: &str, vehicle_id: &str) -> PathBuf {
        self.organization_dir(organization_id).join(vehicle_id)
    }

    /// Files of every type for one vehicle, sorted by type then name. When
    /// `date` is set only names containing it as `YYYYMMDD` are kept. A
    /// missing vehicle or type directory yields no files.
    pub fn scan(
        &self,
        organization_id: &str,
        vehicle_id: &str,
        date: Option<NaiveDate>,
    ) -> Result<Vec<ScannedFile>> {
        let vehicle_dir = self.vehicle_dir(organization_id, vehicle_id);
        let date_token = date.map(|d| d.format("%Y%m%d").to_string());
        let mut files = Vec::new();

        for file_type in FileType::ALL {
            let type_dir = vehicle_dir.join(file_type.directory_name());
            if !type_dir.is_dir() {
                continue;
            }
            let pattern = Pattern::new(&format!("{}_*.txt", file_type.file_prefix()))
                .map_err(|e| IngestError::validation(&type_dir, e.to_string()))?;

            let mut found = Vec::new();
            for entry in WalkDir::new(&type_dir)
                .min_depth(1)
                .max_depth(1) // Only the type directory itself
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if !pattern.matches(&name) {
                    continue;
                }
                if let Some(token) = &date_token {
                    if !name.contains(token.as_str()) {
                        continue;
                    }
                }
                debug!("Found {} file: {}", file_type, entry.path().display());
                found.push(entry.path().to_path_buf());
            }
            found.sort();
            files.extend(found.into_iter().map(|path| ScannedFile { path, file_type }));
        }

        info!(
            "Scanned {} telemetry files in {}",
            files.len(),
            vehicle_dir.display()
        );
        Ok(files)
    }

    /// Vehicle directory names under an organization, sorted.
    pub fn list_vehicles(&self, organization_id: &str) -> Result<Vec<String>> {
        let org_dir = self.organization_dir(organization_id);
        if !org_dir.is_dir() {
            return Err(IngestError::io(
                &org_dir,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "organization directory not found",
                ),
            ));
        }

        let mut vehicles: Vec<String> = WalkDir::new(&org_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        vehicles.sort();
        Ok(vehicles)
    }
}
