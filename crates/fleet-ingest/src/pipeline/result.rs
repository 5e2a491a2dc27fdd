use serde::Serialize;

use super::error::FileError;

/// How one file's attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    New { data_points: u64 },
    Reprocessed { data_points: u64 },
    Skipped { reason: String },
    Failed(FileError),
}

/// A file's outcome plus a failure to release its lock afterwards. The
/// outcome stands either way; the lease lapses at its TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub outcome: FileOutcome,
    pub release_error: Option<FileError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleResult {
    pub organization_id: String,
    pub vehicle_id: String,
    pub new_files: u64,
    pub reprocessed_files: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub total_data_points: u64,
    pub errors: Vec<FileError>,
    pub processing_time_ms: u64,
    /// Another run held the vehicle; nothing was attempted.
    pub vehicle_busy: bool,
    pub files_seen: u64,
}

impl VehicleResult {
    pub fn new(organization_id: &str, vehicle_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::New { data_points } => {
                self.new_files += 1;
                self.total_data_points += data_points;
            }
            FileOutcome::Reprocessed { data_points } => {
                self.reprocessed_files += 1;
                self.total_data_points += data_points;
            }
            FileOutcome::Skipped { .. } => self.skipped_files += 1,
            FileOutcome::Failed(error) => {
                self.failed_files += 1;
                self.errors.push(error);
            }
        }
    }

    pub fn absorb_report(&mut self, report: FileReport) {
        self.absorb(report.outcome);
        self.errors.extend(report.release_error);
    }

    /// Files that ended with data points persisted.
    pub fn processed_files(&self) -> u64 {
        self.new_files + self.reprocessed_files
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationResult {
    pub organization_id: String,
    pub vehicles: Vec<VehicleResult>,
    pub new_files: u64,
    pub reprocessed_files: u64,
    pub skipped_files: u64,
    pub failed_files: u64,
    pub total_data_points: u64,
    pub busy_vehicles: u64,
    /// Failures outside any single vehicle, such as listing the directory.
    pub errors: Vec<FileError>,
    pub processing_time_ms: u64,
}

impl OrganizationResult {
    pub fn new(organization_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            ..Self::default()
        }
    }

    pub fn add_vehicle(&mut self, result: VehicleResult) {
        self.new_files += result.new_files;
        self.reprocessed_files += result.reprocessed_files;
        self.skipped_files += result.skipped_files;
        self.failed_files += result.failed_files;
        self.total_data_points += result.total_data_points;
        if result.vehicle_busy {
            self.busy_vehicles += 1;
        }
        self.vehicles.push(result);
    }
}
