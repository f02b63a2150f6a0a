//! The call session record and its status lifecycle

use std::{cmp::Ordering, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use teleconsult_rtc::types::SessionDescription;

use crate::store::{Document, Precondition};

/// Lifecycle status of a call session.
///
/// Statuses only move forward: `calling` to `connected` or `rejected`, and
/// `calling` or `connected` to `ended`. `rejected` and `ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Calling,
    Connected,
    Rejected,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }

    /// Statuses a record may hold for a write of `self` to be accepted
    pub fn predecessors(self) -> &'static [CallStatus] {
        match self {
            CallStatus::Calling => &[],
            CallStatus::Connected | CallStatus::Rejected => &[CallStatus::Calling],
            CallStatus::Ended => &[CallStatus::Calling, CallStatus::Connected],
        }
    }

    /// Whether a record in status `current` may move to `self`
    pub fn can_follow(self, current: CallStatus) -> bool {
        self.predecessors().contains(&current)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::Calling => "calling",
            CallStatus::Connected => "connected",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }

    fn rank(self) -> u8 {
        match self {
            CallStatus::Calling => 0,
            CallStatus::Connected | CallStatus::Rejected => 1,
            CallStatus::Ended => 2,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `calling < {connected, rejected} < ended`. `connected` and `rejected` are
/// not comparable.
impl PartialOrd for CallStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self == other {
            return Some(Ordering::Equal);
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => None,
            ordering => Some(ordering),
        }
    }
}

/// Which side of a call the local user is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    /// Direction of the candidates this side publishes
    pub fn outgoing(self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::CallerToCallee,
            CallRole::Callee => CandidateDirection::CalleeToCaller,
        }
    }

    /// Direction of the candidates this side consumes
    pub fn incoming(self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::CalleeToCaller,
            CallRole::Callee => CandidateDirection::CallerToCallee,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateDirection {
    CallerToCallee,
    CalleeToCaller,
}

/// The shared record coordinating one call attempt.
///
/// Serialized with camelCase field names and millisecond timestamps, the
/// layout web clients of the same store read and write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub recipient_id: String,
    pub offer: SessionDescription,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    pub status: CallStatus,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// A fresh record in status `calling`
    pub fn new(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        recipient_id: impl Into<String>,
        offer: SessionDescription,
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            caller_id: caller_id.into(),
            recipient_id: recipient_id.into(),
            offer,
            answer: None,
            status: CallStatus::Calling,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(document) => Ok(document),
            _ => Err(serde::ser::Error::custom("call session is not an object")),
        }
    }

    pub fn from_document(document: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(document))
    }
}

/// A partial update of a [`CallSession`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionPatch {
    /// The callee's answer, moving the session to `connected`
    pub fn answered(answer: SessionDescription) -> Self {
        Self { answer: Some(answer), status: Some(CallStatus::Connected), ended_at: None }
    }

    pub fn rejected() -> Self {
        Self { status: Some(CallStatus::Rejected), ended_at: Some(Utc::now()), ..Default::default() }
    }

    pub fn ended() -> Self {
        Self { status: Some(CallStatus::Ended), ended_at: Some(Utc::now()), ..Default::default() }
    }

    /// Fields to merge into the stored record, `updatedAt` included
    pub fn to_fields(&self, now: DateTime<Utc>) -> Result<Document, serde_json::Error> {
        let mut fields = match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => fields,
            _ => return Err(serde::ser::Error::custom("session patch is not an object")),
        };
        fields.insert("updatedAt".to_string(), now.timestamp_millis().into());
        Ok(fields)
    }

    /// Conditions the stored record must meet for this patch to apply.
    ///
    /// A status change requires one of the allowed predecessor statuses and an
    /// answer may only be written once.
    pub fn preconditions(&self) -> Vec<Precondition> {
        let mut preconditions = vec![];
        if let Some(status) = self.status {
            preconditions.push(Precondition::one_of(
                "status",
                status.predecessors().iter().map(|s| s.as_str().into()),
            ));
        }
        if self.answer.is_some() {
            preconditions.push(Precondition::absent("answer"));
        }
        preconditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_partially_ordered() {
        use CallStatus::*;
        assert!(Calling < Connected);
        assert!(Calling < Rejected);
        assert!(Connected < Ended);
        assert!(Rejected < Ended);
        assert_eq!(Connected.partial_cmp(&Rejected), None);
        assert_eq!(Ended.partial_cmp(&Ended), Some(Ordering::Equal));
    }

    #[test]
    fn terminal_statuses_have_no_successor() {
        use CallStatus::*;
        for next in [Calling, Connected, Rejected, Ended] {
            assert!(!next.can_follow(Rejected));
            assert!(!next.can_follow(Ended));
        }
        assert!(Connected.can_follow(Calling));
        assert!(Ended.can_follow(Connected));
        assert!(!Rejected.can_follow(Connected));
        assert!(!Calling.can_follow(Calling));
    }

    #[test]
    fn session_uses_camel_case_and_millisecond_timestamps() {
        let session = CallSession::new("c1", "alice", "bob", SessionDescription::offer("v=0"));
        let document = session.to_document().unwrap();
        assert_eq!(document["callId"], "c1");
        assert_eq!(document["recipientId"], "bob");
        assert_eq!(document["status"], "calling");
        assert_eq!(document["offer"]["type"], "offer");
        assert!(document["answer"].is_null());
        assert_eq!(document["startedAt"], session.started_at.timestamp_millis());

        let decoded = CallSession::from_document(document).unwrap();
        assert_eq!(decoded.call_id, "c1");
        assert_eq!(decoded.started_at.timestamp_millis(), session.started_at.timestamp_millis());
    }

    #[test]
    fn record_without_answer_field_decodes() {
        let json = serde_json::json!({
            "callId": "c2",
            "callerId": "alice",
            "recipientId": "bob",
            "offer": { "type": "offer", "sdp": "v=0" },
            "status": "calling",
            "startedAt": 1700000000000i64,
            "updatedAt": 1700000000000i64,
        });
        let serde_json::Value::Object(document) = json else { unreachable!() };
        let session = CallSession::from_document(document).unwrap();
        assert_eq!(session.answer, None);
        assert_eq!(session.ended_at, None);
    }

    #[test]
    fn patch_fields_only_carry_what_changes() {
        let fields = SessionPatch::answered(SessionDescription::answer("v=0")).to_fields(Utc::now()).unwrap();
        assert_eq!(fields["status"], "connected");
        assert!(fields.contains_key("updatedAt"));
        assert!(!fields.contains_key("endedAt"));
    }

    #[test]
    fn terminal_patches_stamp_ended_at() {
        let fields = SessionPatch::rejected().to_fields(Utc::now()).unwrap();
        assert_eq!(fields["status"], "rejected");
        assert!(!fields.contains_key("answer"));
        assert!(fields["endedAt"].is_i64());

        let fields = SessionPatch::ended().to_fields(Utc::now()).unwrap();
        assert_eq!(fields["status"], "ended");
        assert!(fields["endedAt"].is_i64());
    }

    #[test]
    fn answer_patch_is_guarded() {
        let patch = SessionPatch::answered(SessionDescription::answer("v=0"));
        let preconditions = patch.preconditions();
        assert_eq!(preconditions.len(), 2);
        assert_eq!(preconditions[0], Precondition::one_of("status", ["calling".into()]));
        assert_eq!(preconditions[1], Precondition::absent("answer"));
    }
}
