use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of named resource a client can ask for.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Playback endpoint.
    Sink,
    /// Capture endpoint.
    Source,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Sink => "sink",
            ResourceKind::Source => "source",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sink" => Ok(ResourceKind::Sink),
            "source" => Ok(ResourceKind::Source),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Object class a subscription notification refers to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFacility {
    Autoload,
    Module,
    Card,
    Sink,
    Source,
}

/// What happened to the object.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    New,
    Change,
    Remove,
}

/// Fire-and-forget notification published when a tracked object changes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub facility: SubscriptionFacility,
    pub kind: SubscriptionKind,
    /// Numeric handle of the object (slot index).
    pub index: u32,
}

impl SubscriptionEvent {
    pub fn new(facility: SubscriptionFacility, kind: SubscriptionKind, index: u32) -> Self {
        Self {
            facility,
            kind,
            index,
        }
    }
}

/// Why a card was suspended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuspendCause {
    /// Explicit user request.
    User,
    /// Nothing used the card for a while.
    Idle,
    /// The session lost access to the device node.
    Session,
}
