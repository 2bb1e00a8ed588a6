//! Purpose: Define a stable, structured schema for non-fatal driver notices.
//! Exports: `Notice`, `notice_json`, `NoticeLog`.
//! Role: Shared contract for conductor diagnostics (unblock, revoke, reclaim).
//! Invariants: Notices are non-fatal and never alter engine behavior.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::api::{LifecycleListener, TetherEvent, TetherState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub channel: String,
    pub session_id: i32,
    pub stream_id: i32,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("channel".to_string(), json!(notice.channel));
    inner.insert("session_id".to_string(), json!(notice.session_id));
    inner.insert("stream_id".to_string(), json!(notice.stream_id));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn now_time_string() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:09}", elapsed.as_secs(), elapsed.subsec_nanos())
}

/// Lifecycle listener that renders each event as one notice line on stderr.
pub struct NoticeLog {
    channel: String,
}

impl NoticeLog {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }

    fn emit(
        &self,
        kind: &str,
        session_id: i32,
        stream_id: i32,
        message: String,
        details: Map<String, Value>,
    ) {
        let notice = Notice {
            kind: kind.to_string(),
            time: now_time_string(),
            channel: self.channel.clone(),
            session_id,
            stream_id,
            message,
            details,
        };
        eprintln!("{}", notice_json(&notice));
    }
}

impl LifecycleListener for NoticeLog {
    fn untethered_state_change(&mut self, event: &TetherEvent, new_state: TetherState) {
        let mut details = Map::new();
        details.insert("registration_id".to_string(), json!(event.registration_id));
        details.insert("position".to_string(), json!(event.position));
        details.insert("state".to_string(), json!(format!("{new_state:?}")));
        self.emit(
            "untethered",
            event.session_id,
            event.stream_id,
            "untethered subscriber changed state".to_string(),
            details,
        );
    }

    fn untethered_subscription_removed(&mut self, event: &TetherEvent) {
        let mut details = Map::new();
        details.insert("registration_id".to_string(), json!(event.registration_id));
        details.insert("position".to_string(), json!(event.position));
        self.emit(
            "untethered",
            event.session_id,
            event.stream_id,
            "untethered subscriber removed".to_string(),
            details,
        );
    }

    fn publisher_unblocked(&mut self, session_id: i32, stream_id: i32, position: i64) {
        let mut details = Map::new();
        details.insert("position".to_string(), json!(position));
        self.emit(
            "unblock",
            session_id,
            stream_id,
            "padded over a stalled claim".to_string(),
            details,
        );
    }

    fn publication_revoked(&mut self, session_id: i32, stream_id: i32, position: i64) {
        let mut details = Map::new();
        details.insert("position".to_string(), json!(position));
        self.emit(
            "revoke",
            session_id,
            stream_id,
            "publication revoked".to_string(),
            details,
        );
    }

    fn publication_rejected(
        &mut self,
        session_id: i32,
        stream_id: i32,
        position: i64,
        reason: &str,
    ) {
        let mut details = Map::new();
        details.insert("position".to_string(), json!(position));
        details.insert("reason".to_string(), json!(reason));
        self.emit(
            "reject",
            session_id,
            stream_id,
            "publication entered cool-down".to_string(),
            details,
        );
    }

    fn reached_end_of_life(&mut self, session_id: i32, stream_id: i32, position: i64) {
        let mut details = Map::new();
        details.insert("position".to_string(), json!(position));
        self.emit(
            "reclaim",
            session_id,
            stream_id,
            "publication reached end of life".to_string(),
            details,
        );
    }
}
