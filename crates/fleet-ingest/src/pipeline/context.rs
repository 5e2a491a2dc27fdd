use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;

use super::config::ProcessOptions;
use super::error::Stage;
use super::scanner::ScannedFile;

/// What to ingest for one vehicle.
#[derive(Debug, Clone)]
pub struct VehicleRequest {
    pub organization_id: String,
    pub vehicle_id: String,
    pub date: Option<NaiveDate>,
    pub base_path: PathBuf,
    pub options: ProcessOptions,
}

impl VehicleRequest {
    pub fn new(
        organization_id: impl Into<String>,
        vehicle_id: impl Into<String>,
        base_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            vehicle_id: vehicle_id.into(),
            date: None,
            base_path: base_path.into(),
            options: ProcessOptions::default(),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }
}

/// What to ingest for a whole organization.
#[derive(Debug, Clone)]
pub struct OrganizationRequest {
    pub organization_id: String,
    pub date: Option<NaiveDate>,
    pub base_path: PathBuf,
    pub options: ProcessOptions,
    /// Restricts the run to these vehicles; every vehicle directory otherwise.
    pub vehicle_ids: Option<Vec<String>>,
}

impl OrganizationRequest {
    pub fn new(organization_id: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            organization_id: organization_id.into(),
            date: None,
            base_path: base_path.into(),
            options: ProcessOptions::default(),
            vehicle_ids: None,
        }
    }

    pub fn vehicle_request(&self, vehicle_id: &str) -> VehicleRequest {
        VehicleRequest {
            organization_id: self.organization_id.clone(),
            vehicle_id: vehicle_id.to_string(),
            date: self.date,
            base_path: self.base_path.clone(),
            options: self.options,
        }
    }
}

/// Per-file state kept outside the attempt so a panic can still be
/// accounted for.
pub(crate) struct FileContext {
    pub file: ScannedFile,
    pub stage: Stage,
    pub record_id: Option<String>,
    pub lock_id: Option<String>,
    /// Set once the record was moved to PROCESSING by this attempt.
    pub processing: bool,
}

impl FileContext {
    pub fn new(file: ScannedFile) -> Self {
        Self {
            file,
            stage: Stage::Decide,
            record_id: None,
            lock_id: None,
            processing: false,
        }
    }
}

/// Every lock id acquired during a run, so the run can release whatever
/// is still held when it ends, however it ends.
#[derive(Clone, Default)]
pub(crate) struct LockLedger {
    ids: Arc<Mutex<Vec<String>>>,
}

impl LockLedger {
    pub fn record(&self, lock_id: &str) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.push(lock_id.to_string());
        }
    }

    pub fn forget(&self, lock_id: &str) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.retain(|id| id != lock_id);
        }
    }

    pub fn drain(&self) -> Vec<String> {
        match self.ids.lock() {
            Ok(mut ids) => std::mem::take(&mut *ids),
            // A panic while holding the guard still leaves the ids usable.
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}
