use crate::engine::{EngineState, StopHandle};
use crate::status::MonitorStatus;
use tokio::sync::watch;
use zbus::interface;

pub const BUS_NAME: &str = "org.facewatch.Monitor1";
pub const OBJECT_PATH: &str = "/org/facewatch/Monitor1";

/// D-Bus control surface for the recognition daemon.
///
/// Bus name: org.facewatch.Monitor1
/// Object path: /org/facewatch/Monitor1
pub struct MonitorService {
    status: watch::Receiver<MonitorStatus>,
    stop: StopHandle,
}

impl MonitorService {
    pub fn new(status: watch::Receiver<MonitorStatus>, stop: StopHandle) -> Self {
        Self { status, stop }
    }
}

#[interface(name = "org.facewatch.Monitor1")]
impl MonitorService {
    /// Return daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status.borrow().to_json())
    }

    /// Ask the engine to stop after the current frame.
    ///
    /// Returns `false` if the engine has already stopped or a stop is pending.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        if matches!(self.status.borrow().state, EngineState::Stopped(_)) {
            return Ok(false);
        }
        let requested = self.stop.stop();
        tracing::info!(requested, "stop requested over D-Bus");
        Ok(requested)
    }
}

/// Claim the bus name on the session bus and serve the monitor object.
pub async fn register(service: MonitorService) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
}
