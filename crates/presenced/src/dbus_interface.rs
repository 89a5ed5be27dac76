use crate::engine::LoopEvent;
use crate::service::{Daemon, ServiceError};
use chrono::NaiveDate;
use presence_core::RecordQuery;
use presence_store::EmployeeDetails;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use zbus::object_server::SignalEmitter;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.presence.Attendance1";
pub const OBJECT_PATH: &str = "/org/presence/Attendance1";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.presence.Attendance1
/// Object path: /org/presence/Attendance1
///
/// Structured replies are JSON strings.
pub struct AttendanceService {
    daemon: Arc<Daemon>,
}

impl AttendanceService {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }

    /// Run `op` on the blocking pool and encode its result as JSON.
    async fn call<T, F>(&self, op: F) -> fdo::Result<String>
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&Daemon) -> Result<T, ServiceError> + Send + 'static,
    {
        let daemon = Arc::clone(&self.daemon);
        let value = tokio::task::spawn_blocking(move || op(&daemon))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(|e| {
                tracing::warn!(error = %e, "request failed");
                fdo::Error::Failed(e.to_string())
            })?;
        serde_json::to_string(&value).map_err(|e| fdo::Error::Failed(format!("encode reply: {e}")))
    }
}

fn parse_date(field: &str, value: &str) -> fdo::Result<Option<NaiveDate>> {
    if value.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("{field}: expected YYYY-MM-DD, got {value:?} ({e})")))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[interface(name = "org.presence.Attendance1")]
impl AttendanceService {
    /// Enroll `name` from one or more face images readable by the daemon.
    async fn register(
        &self,
        name: String,
        image_paths: Vec<String>,
        email: String,
        phone: String,
        department: String,
    ) -> fdo::Result<String> {
        tracing::info!(name, images = image_paths.len(), "register requested");
        let paths: Vec<PathBuf> = image_paths.into_iter().map(PathBuf::from).collect();
        let details = EmployeeDetails { email, phone, department };
        self.call(move |d| d.register(&name, &paths, &details)).await
    }

    async fn remove(&self, name: String) -> fdo::Result<bool> {
        tracing::info!(name, "remove requested");
        let daemon = Arc::clone(&self.daemon);
        tokio::task::spawn_blocking(move || daemon.remove(&name))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    async fn list_identities(&self) -> fdo::Result<String> {
        self.call(|d| d.identities()).await
    }

    /// Manual checkout. Fails unless `name` is checked in today.
    async fn checkout(&self, name: String) -> fdo::Result<String> {
        tracing::info!(name, "checkout requested");
        self.call(move |d| d.checkout(&name)).await
    }

    /// Today's attendance state for `name`.
    async fn status(&self, name: String) -> fdo::Result<String> {
        self.call(move |d| d.status(&name)).await
    }

    async fn today(&self) -> fdo::Result<String> {
        self.call(|d| d.today_records()).await
    }

    async fn checked_in(&self) -> fdo::Result<String> {
        self.call(|d| d.checked_in()).await
    }

    /// Records filtered by inclusive date range and name. Empty strings mean no filter.
    async fn records(&self, from: String, to: String, name: String) -> fdo::Result<String> {
        let query = RecordQuery {
            from: parse_date("from", &from)?,
            to: parse_date("to", &to)?,
            name: non_empty(&name),
        };
        self.call(move |d| d.records(&query)).await
    }

    async fn summary(&self, from: String, to: String) -> fdo::Result<String> {
        let from = parse_date("from", &from)?;
        let to = parse_date("to", &to)?;
        self.call(move |d| d.summary(from, to)).await
    }

    /// Start the recognition loop. `false` if it was already running.
    async fn start(&self) -> fdo::Result<bool> {
        let daemon = Arc::clone(&self.daemon);
        tokio::task::spawn_blocking(move || daemon.start())
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Stop the recognition loop. `false` if it was not running.
    async fn stop(&self) -> fdo::Result<bool> {
        let daemon = Arc::clone(&self.daemon);
        let stopped = tokio::task::spawn_blocking(move || daemon.stop())
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        Ok(stopped.is_some())
    }

    /// Return daemon status information.
    async fn daemon_status(&self) -> fdo::Result<String> {
        serde_json::to_string(&self.daemon.daemon_status())
            .map_err(|e| fdo::Error::Failed(format!("encode reply: {e}")))
    }

    /// Delete all attendance records, employees and templates.
    async fn purge(&self) -> fdo::Result<String> {
        tracing::warn!("purge requested");
        self.call(|d| d.purge()).await
    }

    /// An attendance record was opened or closed.
    #[zbus(signal)]
    async fn attendance_changed(
        emitter: &SignalEmitter<'_>,
        name: &str,
        status: &str,
        timestamp: &str,
    ) -> zbus::Result<()>;

    /// A face was seen by the camera, matched or not.
    #[zbus(signal)]
    async fn face_seen(
        emitter: &SignalEmitter<'_>,
        name: &str,
        confidence: f64,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> zbus::Result<()>;
}

/// Re-emit recognition loop events as D-Bus signals until the channel closes.
pub async fn forward_events(
    connection: zbus::Connection,
    mut events: broadcast::Receiver<LoopEvent>,
) -> zbus::Result<()> {
    let iface = connection
        .object_server()
        .interface::<_, AttendanceService>(OBJECT_PATH)
        .await?;
    let emitter = iface.signal_emitter();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "signal forwarder lagging; events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        let sent = match &event {
            LoopEvent::Sighting(s) => {
                AttendanceService::face_seen(
                    emitter,
                    &s.name,
                    f64::from(s.confidence),
                    s.region.x,
                    s.region.y,
                    s.region.width,
                    s.region.height,
                )
                .await
            }
            LoopEvent::Attendance(a) if a.outcome.wrote_ledger() => {
                let timestamp = a.timestamp.format(TIMESTAMP_FORMAT).to_string();
                AttendanceService::attendance_changed(emitter, &a.name, a.outcome.label(), &timestamp).await
            }
            LoopEvent::Attendance(_) => Ok(()),
            LoopEvent::Stopped(reason) => {
                tracing::info!(%reason, "recognition loop stopped");
                Ok(())
            }
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }
}
