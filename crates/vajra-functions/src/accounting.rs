// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation accounting.
//!
//! Every invocation appends a log entry and bumps `invocation_count`; every
//! failed invocation additionally appends an error entry and bumps
//! `error_count`. Accounting is best-effort: failures are logged and
//! swallowed so they never change an invocation's response.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::model::FunctionRecord;
use crate::registry::{Counter, Registry};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Invocation recorded
    Info,
    /// Invocation failed
    Error,
}

/// One entry of a function's invocation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Message
    pub message: String,
    /// Serialized payload size, for invocation entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    /// Whether the invocation was a test invocation
    #[serde(default)]
    pub test_mode: bool,
}

/// Destination for invocation log entries.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append an entry to a function's log.
    async fn append(&self, tenant_id: &str, name: &str, entry: LogEntry) -> Result<()>;

    /// Most recent entries, newest first.
    async fn recent(&self, tenant_id: &str, name: &str, limit: usize) -> Result<Vec<LogEntry>>;

    /// Drop a function's log.
    async fn purge(&self, tenant_id: &str, name: &str) -> Result<()>;
}

/// Log sink keeping the last `retention` entries per function in memory.
pub struct MemoryLogSink {
    retention: usize,
    logs: RwLock<HashMap<(String, String), VecDeque<LogEntry>>>,
}

impl MemoryLogSink {
    /// Create a sink retaining up to `retention` entries per function.
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, tenant_id: &str, name: &str, entry: LogEntry) -> Result<()> {
        let mut logs = self.logs.write().await;
        let log = logs
            .entry((tenant_id.to_string(), name.to_string()))
            .or_default();
        log.push_back(entry);
        while log.len() > self.retention {
            log.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, tenant_id: &str, name: &str, limit: usize) -> Result<Vec<LogEntry>> {
        let logs = self.logs.read().await;
        Ok(logs
            .get(&(tenant_id.to_string(), name.to_string()))
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn purge(&self, tenant_id: &str, name: &str) -> Result<()> {
        self.logs
            .write()
            .await
            .remove(&(tenant_id.to_string(), name.to_string()));
        Ok(())
    }
}

/// Counter-derived metrics for a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetrics {
    /// Function name
    pub name: String,
    /// Current version
    pub version: u32,
    /// Total invocations
    pub invocations: u64,
    /// Failed invocations
    pub errors: u64,
    /// Fraction of invocations that succeeded, 1.0 when never invoked
    pub success_rate: f64,
}

impl FunctionMetrics {
    /// Derive metrics from a record's counters.
    pub fn from_record(record: &FunctionRecord) -> Self {
        let success_rate = if record.invocation_count == 0 {
            1.0
        } else {
            let failed = record.error_count.min(record.invocation_count);
            (record.invocation_count - failed) as f64 / record.invocation_count as f64
        };
        Self {
            name: record.name.clone(),
            version: record.version,
            invocations: record.invocation_count,
            errors: record.error_count,
            success_rate,
        }
    }
}

/// Records invocation outcomes into a log sink and the registry counters.
pub struct Accounting {
    registry: Arc<dyn Registry>,
    sink: Arc<dyn LogSink>,
}

impl Accounting {
    /// Create accounting over a registry and a log sink.
    pub fn new(registry: Arc<dyn Registry>, sink: Arc<dyn LogSink>) -> Self {
        Self { registry, sink }
    }

    /// Record that an invocation happened.
    pub async fn record_invocation(
        &self,
        tenant_id: &str,
        name: &str,
        payload_size: usize,
        test_mode: bool,
    ) {
        info!(
            tenant_id = %tenant_id,
            function = %name,
            payload_size,
            test_mode,
            "Function invoked"
        );

        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: if test_mode {
                "Test invocation".to_string()
            } else {
                "Function invoked".to_string()
            },
            payload_size: Some(payload_size),
            test_mode,
        };
        if let Err(e) = self.sink.append(tenant_id, name, entry).await {
            warn!(tenant_id = %tenant_id, function = %name, error = %e, "Failed to write invocation log");
        }
        self.increment(tenant_id, name, Counter::Invocations).await;
    }

    /// Record that an invocation failed.
    pub async fn record_error(&self, tenant_id: &str, name: &str, message: &str) {
        error!(tenant_id = %tenant_id, function = %name, error = %message, "Function error");

        let entry = LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Error,
            message: message.to_string(),
            payload_size: None,
            test_mode: false,
        };
        if let Err(e) = self.sink.append(tenant_id, name, entry).await {
            warn!(tenant_id = %tenant_id, function = %name, error = %e, "Failed to write error log");
        }
        self.increment(tenant_id, name, Counter::Errors).await;
    }

    async fn increment(&self, tenant_id: &str, name: &str, counter: Counter) {
        match self.registry.increment_counter(tenant_id, name, counter).await {
            Ok(updated) if !updated.value => {
                warn!(tenant_id = %tenant_id, function = %name, counter = counter.column(), "Counter target vanished");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    function = %name,
                    counter = counter.column(),
                    error = %e,
                    "Failed to increment counter"
                );
            }
        }
    }

    /// Recent log entries, newest first.
    pub async fn logs(&self, tenant_id: &str, name: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.sink.recent(tenant_id, name, limit).await
    }

    /// Drop a function's log. Failures are logged and ignored.
    pub async fn purge(&self, tenant_id: &str, name: &str) {
        if let Err(e) = self.sink.purge(tenant_id, name).await {
            warn!(tenant_id = %tenant_id, function = %name, error = %e, "Failed to purge logs");
        }
    }
}
