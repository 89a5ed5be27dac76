//! Operator operations behind the D-Bus surface.
//!
//! Everything here is synchronous and may block on SQLite, the filesystem or
//! the recognition thread; the D-Bus layer runs it on the blocking pool.

use crate::config::Config;
use crate::engine::{EngineError, LoopController, LoopEvent, Pipeline, StopReason, EVENT_CAPACITY};
use chrono::NaiveDate;
use presence_core::enroll::{self, EnrollError, Enrollment};
use presence_core::registry::RegistryError;
use presence_core::{
    AttendanceDayRecord, AttendanceOutcome, AttendanceStateMachine, Clock, CooldownGate, DayStatus, FaceDetector,
    Ledger, LedgerError, RecordQuery, TemplateRegistry,
};
use presence_hw::CameraError;
use presence_store::{AttendanceStore, AttendanceSummary, EmployeeDetails, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("no images given")]
    NoImages,
    #[error("cannot read image {path}: {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("template registry: {0}")]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A registered identity with its directory entry, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub name: String,
    pub has_template: bool,
    #[serde(flatten)]
    pub details: Option<EmployeeDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub running: bool,
    pub camera: Option<String>,
    pub identities: usize,
    pub match_threshold: f32,
    pub cooldown_secs: u64,
    pub detector: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub attendance: usize,
    pub employees: usize,
    pub templates: usize,
}

pub struct Daemon {
    config: Config,
    registry: Arc<TemplateRegistry>,
    store: Arc<AttendanceStore>,
    controller: LoopController,
}

impl Daemon {
    pub fn new(
        config: Config,
        registry: Arc<TemplateRegistry>,
        store: Arc<AttendanceStore>,
        detector: Box<dyn FaceDetector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pipeline = Pipeline {
            registry: Arc::clone(&registry),
            detector: Arc::new(Mutex::new(detector)),
            machine: AttendanceStateMachine::new(store.clone()),
            clock,
            gate: Arc::new(Mutex::new(CooldownGate::new(config.cooldown()))),
            threshold: config.match_threshold,
            dark_fraction: config.dark_fraction,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry,
            store,
            controller: LoopController::new(pipeline, events),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.controller.subscribe()
    }

    fn today(&self) -> NaiveDate {
        self.controller.pipeline().clock.now().date()
    }

    fn machine(&self) -> &AttendanceStateMachine {
        &self.controller.pipeline().machine
    }

    /// Enroll `name` from one or more images and record the directory entry.
    ///
    /// A failed registry save leaves the new template active in memory.
    pub fn register(
        &self,
        name: &str,
        image_paths: &[PathBuf],
        details: &EmployeeDetails,
    ) -> Result<Enrollment, ServiceError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::EmptyName);
        }
        if image_paths.is_empty() {
            return Err(ServiceError::NoImages);
        }
        let images = image_paths
            .iter()
            .map(|path| load_gray(path))
            .collect::<Result<Vec<_>, _>>()?;

        let enrollment = {
            let mut detector = self
                .controller
                .pipeline()
                .detector
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            enroll::enroll(&self.registry, &mut **detector, name, &images)?
        };
        self.registry.save()?;
        self.store.upsert_employee(name, details)?;
        Ok(enrollment)
    }

    /// Remove the template and directory entry. Attendance history stays.
    pub fn remove(&self, name: &str) -> Result<bool, ServiceError> {
        let had_template = self.registry.remove(name);
        if had_template {
            self.registry.save()?;
        }
        let had_employee = self.store.remove_employee(name)?;
        tracing::info!(name, had_template, had_employee, "identity removed");
        Ok(had_template || had_employee)
    }

    pub fn identities(&self) -> Result<Vec<Identity>, ServiceError> {
        let mut names = self.registry.names();
        let employees = self.store.employees()?;
        names.extend(employees.iter().map(|e| e.name.clone()));

        Ok(names
            .into_iter()
            .map(|name| Identity {
                has_template: self.registry.get(&name).is_some(),
                details: employees.iter().find(|e| e.name == name).map(|e| e.details.clone()),
                name,
            })
            .collect())
    }

    pub fn checkout(&self, name: &str) -> Result<AttendanceOutcome, ServiceError> {
        let now = self.controller.pipeline().clock.now();
        Ok(self.machine().manual_checkout(name, now)?)
    }

    pub fn status(&self, name: &str) -> Result<DayStatus, ServiceError> {
        Ok(self.machine().status(name, self.today())?)
    }

    pub fn today_records(&self) -> Result<Vec<AttendanceDayRecord>, ServiceError> {
        Ok(self.machine().ledger().query(&RecordQuery::on(self.today()))?)
    }

    /// Open records for today, earliest check-in first.
    pub fn checked_in(&self) -> Result<Vec<AttendanceDayRecord>, ServiceError> {
        Ok(self.machine().ledger().checked_in(self.today())?)
    }

    pub fn records(&self, query: &RecordQuery) -> Result<Vec<AttendanceDayRecord>, ServiceError> {
        Ok(self.machine().ledger().query(query)?)
    }

    pub fn summary(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceSummary>, ServiceError> {
        Ok(self.store.summary(from, to)?)
    }

    /// Start the recognition loop on the configured camera.
    pub fn start(&self) -> Result<bool, ServiceError> {
        let mut camera = self.config.camera()?;
        Ok(self.controller.start(camera.as_mut())?)
    }

    pub fn stop(&self) -> Result<Option<StopReason>, ServiceError> {
        Ok(self.controller.stop()?)
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            running: self.controller.is_running(),
            camera: self.controller.camera(),
            identities: self.registry.len(),
            match_threshold: self.config.match_threshold,
            cooldown_secs: self.config.cooldown_secs,
            detector: self.config.detector.clone(),
        }
    }

    /// Delete all attendance, employees and templates.
    pub fn purge(&self) -> Result<PurgeReport, ServiceError> {
        let counts = self.store.purge()?;
        let templates = self.registry.clear();
        self.registry.save()?;
        Ok(PurgeReport {
            attendance: counts.attendance,
            employees: counts.employees,
            templates,
        })
    }
}

fn load_gray(path: &Path) -> Result<image::GrayImage, ServiceError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| ServiceError::Image {
            path: path.to_path_buf(),
            source,
        })
}
