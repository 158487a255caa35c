use serde::{Deserialize, Serialize};

/// Maximum message size for IPC (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Shortest user boost accepted by the daemon, in milliseconds
pub const MIN_BOOST_MS: u32 = 100;

/// Longest user boost accepted by the daemon, in milliseconds
pub const MAX_BOOST_MS: u32 = 5000;

/// Upper bound for the deferred-off delay, in milliseconds
pub const MAX_OFF_DELAY_MS: u64 = 60_000;

/// Vote reasons accepted over the socket
pub const KNOWN_REASONS: &[&str] = &["scheduler", "user", "manual"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GetStatus,
    /// Set or clear a named vote. `wait` selects the synchronous path that
    /// reports the hardware result back to the caller.
    SetVote { reason: String, active: bool, #[serde(default)] wait: bool },
    Boost { duration_ms: u32 },
    GetThresholds,
    SetThresholds { update: ThresholdUpdate },
    /// Device reset happened; resync the hardware state
    NotifyReset,
    /// Ask for an opportunistic traffic re-evaluation
    Poke,
    ReloadConfig,
}

impl Request {
    /// Validate request parameters before sending to daemon
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping
            | Request::Version
            | Request::GetStatus
            | Request::GetThresholds
            | Request::NotifyReset
            | Request::Poke
            | Request::ReloadConfig => Ok(()),

            Request::SetVote { reason, .. } => validate_reason(reason),

            // Out-of-range durations are clamped by the controller, only
            // reject values that cannot be meaningful.
            Request::Boost { duration_ms } => validate_boost_ms(*duration_ms),

            Request::SetThresholds { update } => update.validate(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetStatus => "GetStatus",
            Request::SetVote { .. } => "SetVote",
            Request::Boost { .. } => "Boost",
            Request::GetThresholds => "GetThresholds",
            Request::SetThresholds { .. } => "SetThresholds",
            Request::NotifyReset => "NotifyReset",
            Request::Poke => "Poke",
            Request::ReloadConfig => "ReloadConfig",
        }
    }

    /// Whether the request changes controller state (audit logged)
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Request::SetVote { .. }
                | Request::Boost { .. }
                | Request::SetThresholds { .. }
                | Request::NotifyReset
                | Request::ReloadConfig
        )
    }
}

/// Thresholds as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdInfo {
    pub on_slots: u32,
    pub on_bytes: u64,
    pub on_sync_bytes: u64,
    pub off_slots: u32,
    pub off_bytes: u64,
    pub off_sync_bytes: u64,
    pub off_delay_ms: u64,
}

/// Partial threshold write; absent fields keep their current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_slots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_sync_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_slots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_sync_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_delay_ms: Option<u64>,
}

impl ThresholdUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("Threshold update must set at least one field".into());
        }
        if let Some(delay) = self.off_delay_ms {
            if delay > MAX_OFF_DELAY_MS {
                return Err(format!("off_delay_ms too long (maximum {})", MAX_OFF_DELAY_MS));
            }
        }
        Ok(())
    }

    /// Overlay this update on top of `current`
    pub fn apply_to(&self, current: ThresholdInfo) -> ThresholdInfo {
        ThresholdInfo {
            on_slots: self.on_slots.unwrap_or(current.on_slots),
            on_bytes: self.on_bytes.unwrap_or(current.on_bytes),
            on_sync_bytes: self.on_sync_bytes.unwrap_or(current.on_sync_bytes),
            off_slots: self.off_slots.unwrap_or(current.off_slots),
            off_bytes: self.off_bytes.unwrap_or(current.off_bytes),
            off_sync_bytes: self.off_sync_bytes.unwrap_or(current.off_sync_bytes),
            off_delay_ms: self.off_delay_ms.unwrap_or(current.off_delay_ms),
        }
    }
}

/// Snapshot of the controller as reported by GetStatus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// "on" or "off"
    pub wb_state: String,
    /// "idle" or "active"
    pub auto_state: String,
    pub active_votes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost_remaining_ms: Option<u64>,
    pub thresholds: ThresholdInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data - each field is optional so one shape serves every request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<StatusInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<ThresholdInfo>,
    /// Effective boost duration after clamping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost_ms: Option<u64>,
}

impl ResponseData {
    pub fn none() -> Self { Self::default() }
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn status(s: StatusInfo) -> Self { Self { controller: Some(s), ..Self::default() } }
    pub fn thresholds(t: ThresholdInfo) -> Self { Self { thresholds: Some(t), ..Self::default() } }
    pub fn boost(ms: u64) -> Self { Self { boost_ms: Some(ms), ..Self::default() } }
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s.into()))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error { message: msg.into() }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

pub fn validate_reason(reason: &str) -> Result<(), String> {
    if reason.is_empty() {
        return Err("Reason cannot be empty".into());
    }
    if !KNOWN_REASONS.contains(&reason) {
        return Err(format!("Unknown reason {:?} (expected one of {:?})", reason, KNOWN_REASONS));
    }
    Ok(())
}

pub fn validate_boost_ms(duration_ms: u32) -> Result<(), String> {
    if duration_ms == 0 {
        return Err("Boost duration must be non-zero".into());
    }
    // Anything above a minute is almost certainly a unit mistake
    if duration_ms > 60_000 {
        return Err(format!("Boost duration too long: {}ms", duration_ms));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let envelope = RequestEnvelope {
            id: 7,
            request: Request::SetVote { reason: "scheduler".into(), active: true, wait: true },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""cmd":"SetVote""#));
        assert!(json.contains(r#""id":7"#));

        let parsed: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.request.type_name(), "SetVote");
    }

    #[test]
    fn test_set_vote_wait_defaults_to_false() {
        let json = r#"{"id":1,"cmd":"SetVote","data":{"reason":"manual","active":false}}"#;
        let parsed: RequestEnvelope = serde_json::from_str(json).unwrap();
        match parsed.request {
            Request::SetVote { wait, .. } => assert!(!wait),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_reason() {
        let req = Request::SetVote { reason: "thermal".into(), active: true, wait: false };
        assert!(req.validate().is_err());
        assert!(Request::SetVote { reason: "user".into(), active: true, wait: false }
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_boost() {
        assert!(Request::Boost { duration_ms: 0 }.validate().is_err());
        assert!(Request::Boost { duration_ms: 50 }.validate().is_ok());
        assert!(Request::Boost { duration_ms: 120_000 }.validate().is_err());
    }

    #[test]
    fn test_threshold_update_overlay() {
        let current = ThresholdInfo {
            on_slots: 28,
            on_bytes: 8 << 20,
            on_sync_bytes: 1 << 20,
            off_slots: 12,
            off_bytes: 2 << 20,
            off_sync_bytes: 256 << 10,
            off_delay_ms: 5000,
        };
        let update = ThresholdUpdate { off_slots: Some(4), ..ThresholdUpdate::default() };
        let merged = update.apply_to(current);
        assert_eq!(merged.off_slots, 4);
        assert_eq!(merged.on_slots, 28);
        assert_eq!(merged.off_delay_ms, 5000);
    }

    #[test]
    fn test_empty_threshold_update_rejected() {
        let req = Request::SetThresholds { update: ThresholdUpdate::default() };
        assert!(req.validate().is_err());
        let req = Request::SetThresholds {
            update: ThresholdUpdate { off_delay_ms: Some(MAX_OFF_DELAY_MS + 1), ..Default::default() },
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let env = ResponseEnvelope::new(3, Response::error("nope"));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""status":"error""#));
        assert!(json.contains(r#""message":"nope""#));
    }
}
