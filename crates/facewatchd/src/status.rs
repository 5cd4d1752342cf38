//! Latest-status snapshot shared with the D-Bus surface through a `watch` channel.

use crate::engine::{EngineState, FrameUpdate, StopReason};

#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub source: String,
    pub state: EngineState,
    pub frames: u64,
    pub faces_known: u64,
    pub faces_unknown: u64,
    pub unknown_events: u64,
    pub last_unknown: Option<String>,
}

impl MonitorStatus {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: EngineState::Initializing,
            frames: 0,
            faces_known: 0,
            faces_unknown: 0,
            unknown_events: 0,
            last_unknown: None,
        }
    }

    pub fn record_frame(&mut self, update: &FrameUpdate) {
        self.frames += 1;
        self.faces_known += update.known as u64;
        self.faces_unknown += update.unknown as u64;
        if let Some(event) = &update.logged {
            self.unknown_events += 1;
            self.last_unknown = Some(event.image_path.display().to_string());
        }
    }

    pub fn to_json(&self) -> String {
        let error = match &self.state {
            EngineState::Stopped(StopReason::Error(msg)) => Some(msg.as_str()),
            _ => None,
        };
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "source": self.source,
            "state": self.state.name(),
            "error": error,
            "frames": self.frames,
            "faces_known": self.faces_known,
            "faces_unknown": self.faces_unknown,
            "unknown_events": self.unknown_events,
            "last_unknown": self.last_unknown,
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::UnknownEvent;
    use image::RgbImage;

    fn update(known: usize, unknown: usize, logged: Option<&str>) -> FrameUpdate {
        FrameUpdate {
            sequence: 1,
            annotated: RgbImage::new(1, 1),
            known,
            unknown,
            logged: logged.and_then(|line| UnknownEvent::parse(line)),
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let mut status = MonitorStatus::new("/dev/video0");
        status.record_frame(&update(1, 0, None));
        status.record_frame(&update(0, 2, Some("t1 - Unknown detected - saved to logs/u1.jpg")));
        status.record_frame(&update(0, 1, None));

        assert_eq!(status.frames, 3);
        assert_eq!(status.faces_known, 1);
        assert_eq!(status.faces_unknown, 3);
        assert_eq!(status.unknown_events, 1);
        assert_eq!(status.last_unknown.as_deref(), Some("logs/u1.jpg"));
    }

    #[test]
    fn test_json_reports_state_and_error() {
        let mut status = MonitorStatus::new("frames/");
        status.state = EngineState::Stopped(StopReason::Error("gallery error: empty".into()));
        let json: serde_json::Value = serde_json::from_str(&status.to_json()).unwrap();

        assert_eq!(json["state"], "stopped");
        assert_eq!(json["error"], "gallery error: empty");
        assert_eq!(json["source"], "frames/");
        assert_eq!(json["frames"], 0);

        status.state = EngineState::Running;
        let json: serde_json::Value = serde_json::from_str(&status.to_json()).unwrap();
        assert!(json["error"].is_null());
    }
}
