//! Provider event log.
//!
//! A bounded ring buffer of timestamped records covering the interesting
//! transitions of a provider manager: client churn, merged-request pushes,
//! fix receipt and delivery, enabled transitions, mock toggles. Used by the
//! debug dump and kept deliberately cheap to write.

use crate::identity::{CallerIdentity, UserId};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 256;

/// One loggable transition.
#[derive(Debug, Clone)]
pub enum Event {
    ClientRegistered {
        identity: CallerIdentity,
        request: String,
    },
    ClientUnregistered {
        identity: CallerIdentity,
    },
    UpdateRequest {
        request: String,
    },
    LocationReceived,
    LocationDelivered {
        identity: CallerIdentity,
    },
    EnabledChanged {
        user_id: UserId,
        enabled: bool,
    },
    MockToggled {
        mocked: bool,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ClientRegistered { identity, request } => {
                write!(f, "+registration {} -> {}", identity, request)
            }
            Event::ClientUnregistered { identity } => write!(f, "-registration {}", identity),
            Event::UpdateRequest { request } => write!(f, "request = {}", request),
            Event::LocationReceived => write!(f, "received location"),
            Event::LocationDelivered { identity } => write!(f, "delivered location to {}", identity),
            Event::EnabledChanged { user_id, enabled } => {
                write!(f, "[u{}] enabled = {}", user_id, enabled)
            }
            Event::MockToggled { mocked } => write!(f, "mock = {}", mocked),
        }
    }
}

/// A record with its wall-clock timestamp.
#[derive(Debug, Clone)]
pub struct Record {
    pub at: DateTime<Utc>,
    pub event: Event,
}

/// Bounded in-memory event log for one provider.
pub struct EventLog {
    provider: String,
    capacity: usize,
    records: Mutex<VecDeque<Record>>,
}

impl EventLog {
    pub fn new(provider: impl Into<String>, capacity: usize) -> Self {
        Self {
            provider: provider.into(),
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn log(&self, event: Event) {
        debug!(provider = %self.provider, "{}", event);

        let mut records = self.records.lock().unwrap();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(Record {
            at: Utc::now(),
            event,
        });
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Copy of the current records, oldest first.
    pub fn snapshot(&self) -> Vec<Record> {
        self.records.lock().unwrap().iter().cloned().collect()
    }
}
