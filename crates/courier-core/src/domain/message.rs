//! Message model: payload + queue bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{MessageId, WorkerId};

/// How the body should be rendered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Text,
    Html,
}

/// Outbound notification content.
///
/// The queue never looks inside; only the transport does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub body_kind: BodyKind,
}

impl Payload {
    pub fn text(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            body_kind: BodyKind::Text,
        }
    }

    pub fn html(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            body_kind: BodyKind::Html,
            ..Self::text(from, to, subject, body)
        }
    }
}

/// Logical state of a message, derived from its record.
///
/// State transitions:
/// - Pending -> Sent
/// - Pending -> Pending (retry) -> ... -> TerminallyFailed
///
/// Sent and TerminallyFailed are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sent,
    TerminallyFailed,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageState::Pending)
    }
}

/// Stored form of a message. Single source of truth for its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub payload: Payload,

    /// Worker currently holding the claim. Only meaningful while pending.
    pub owner: Option<WorkerId>,

    /// When the current claim was taken. Cleared together with `owner`.
    pub claimed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Set exactly once, on successful delivery.
    pub sent_at: Option<DateTime<Utc>>,

    /// Never decreases.
    pub failed_attempts: u32,

    pub terminally_failed: bool,
}

impl MessageRecord {
    pub fn new(id: MessageId, payload: Payload, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            owner: None,
            claimed_at: None,
            created_at,
            sent_at: None,
            failed_attempts: 0,
            terminally_failed: false,
        }
    }

    pub fn state(&self) -> MessageState {
        if self.sent_at.is_some() {
            MessageState::Sent
        } else if self.terminally_failed {
            MessageState::TerminallyFailed
        } else {
            MessageState::Pending
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn is_owned_by(&self, owner: &WorkerId) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    /// Eligible for `claim_unowned`: pending, still within the retry budget, and
    /// either unowned or holding a claim taken before `stale_before`.
    pub fn is_claimable(&self, stale_before: Option<DateTime<Utc>>, max_attempts: u32) -> bool {
        if !self.is_pending() || self.failed_attempts >= max_attempts {
            return false;
        }
        match (&self.owner, self.claimed_at, stale_before) {
            (None, _, _) => true,
            (Some(_), Some(claimed_at), Some(cutoff)) => claimed_at < cutoff,
            _ => false,
        }
    }

    pub fn claim(&mut self, owner: &WorkerId, now: DateTime<Utc>) {
        self.owner = Some(owner.clone());
        self.claimed_at = Some(now);
    }

    pub fn release(&mut self) {
        self.owner = None;
        self.claimed_at = None;
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.sent_at = Some(now);
        self.release();
    }

    /// Count one failed attempt. Returns true when this attempt exhausted the budget.
    pub fn mark_failed(&mut self, max_attempts: u32) -> bool {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.release();
        if self.failed_attempts >= max_attempts {
            self.terminally_failed = true;
        }
        self.terminally_failed
    }
}
