use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::info;

/// Type of key lifecycle event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Register,
    Retrieve,
    Unregister,
    Rollback,
    Error,
}

/// Record of a key lifecycle event
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub item_id: String,
    pub endpoint: Option<String>, // set when the event concerns one endpoint
    pub message: String,
    pub timestamp: String, // RFC3339
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, item_id: &str, message: impl Into<String>) -> Self {
        AuditRecord {
            event_type,
            item_id: item_id.to_string(),
            endpoint: None,
            message: message.into(),
            timestamp: now_rfc3339(),
        }
    }

    pub fn at_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::Register => "REGISTER",
            AuditEventType::Retrieve => "RETRIEVE",
            AuditEventType::Unregister => "UNREGISTER",
            AuditEventType::Rollback => "ROLLBACK",
            AuditEventType::Error => "ERROR",
        }
    }
}

/// Bounded in-memory audit tracker
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a new event, evicting the oldest once full
    pub fn log(&self, record: AuditRecord) {
        info!(
            target: "eds::audit",
            event = record.event_type_label(),
            item_id = %record.item_id,
            endpoint = record.endpoint.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );

        let mut records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if records.len() == self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, newest first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
