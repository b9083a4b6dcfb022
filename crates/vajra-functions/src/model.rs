// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function data model.
//!
//! A [`FunctionRecord`] is the live metadata for one function of one tenant.
//! Its code lives in the artifact store and is referenced through [`CodeRef`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// Runtime family. Each family maps to one execution strategy in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFamily {
    /// WebAssembly modules, executed in-process
    Wasm,
    /// CPython
    Python,
    /// Node.js
    Node,
    /// Go toolchain
    Go,
    /// JVM
    Java,
    /// Cargo toolchain
    Rust,
    /// .NET
    Dotnet,
}

impl RuntimeFamily {
    /// File extension of entry files for this family.
    pub fn entry_extension(&self) -> &'static str {
        match self {
            RuntimeFamily::Wasm => "wasm",
            RuntimeFamily::Python => "py",
            RuntimeFamily::Node => "js",
            RuntimeFamily::Go => "go",
            RuntimeFamily::Java => "java",
            RuntimeFamily::Rust => "rs",
            RuntimeFamily::Dotnet => "cs",
        }
    }

    /// Module name used when the handler does not name one.
    pub fn default_module(&self) -> &'static str {
        match self {
            RuntimeFamily::Node => "index",
            RuntimeFamily::Java => "Main",
            _ => "main",
        }
    }
}

/// Supported runtime identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Runtime {
    /// `wasm`
    #[serde(rename = "wasm")]
    Wasm,
    /// `python3.8`
    #[serde(rename = "python3.8")]
    Python38,
    /// `python3.9`
    #[serde(rename = "python3.9")]
    Python39,
    /// `python3.10`
    #[serde(rename = "python3.10")]
    Python310,
    /// `python3.11`
    #[serde(rename = "python3.11")]
    Python311,
    /// `python3.12`
    #[serde(rename = "python3.12")]
    Python312,
    /// `nodejs16`
    #[serde(rename = "nodejs16")]
    Nodejs16,
    /// `nodejs18`
    #[serde(rename = "nodejs18")]
    Nodejs18,
    /// `nodejs20`
    #[serde(rename = "nodejs20")]
    Nodejs20,
    /// `go1.19`
    #[serde(rename = "go1.19")]
    Go119,
    /// `go1.20`
    #[serde(rename = "go1.20")]
    Go120,
    /// `go1.21`
    #[serde(rename = "go1.21")]
    Go121,
    /// `java11`
    #[serde(rename = "java11")]
    Java11,
    /// `java17`
    #[serde(rename = "java17")]
    Java17,
    /// `java21`
    #[serde(rename = "java21")]
    Java21,
    /// `rust1.70`
    #[serde(rename = "rust1.70")]
    Rust170,
    /// `dotnet6`
    #[serde(rename = "dotnet6")]
    Dotnet6,
    /// `dotnet8`
    #[serde(rename = "dotnet8")]
    Dotnet8,
}

impl Runtime {
    /// Every runtime accepted at creation.
    pub const ALL: [Runtime; 18] = [
        Runtime::Wasm,
        Runtime::Python38,
        Runtime::Python39,
        Runtime::Python310,
        Runtime::Python311,
        Runtime::Python312,
        Runtime::Nodejs16,
        Runtime::Nodejs18,
        Runtime::Nodejs20,
        Runtime::Go119,
        Runtime::Go120,
        Runtime::Go121,
        Runtime::Java11,
        Runtime::Java17,
        Runtime::Java21,
        Runtime::Rust170,
        Runtime::Dotnet6,
        Runtime::Dotnet8,
    ];

    /// Wire identifier, e.g. `python3.11`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Wasm => "wasm",
            Runtime::Python38 => "python3.8",
            Runtime::Python39 => "python3.9",
            Runtime::Python310 => "python3.10",
            Runtime::Python311 => "python3.11",
            Runtime::Python312 => "python3.12",
            Runtime::Nodejs16 => "nodejs16",
            Runtime::Nodejs18 => "nodejs18",
            Runtime::Nodejs20 => "nodejs20",
            Runtime::Go119 => "go1.19",
            Runtime::Go120 => "go1.20",
            Runtime::Go121 => "go1.21",
            Runtime::Java11 => "java11",
            Runtime::Java17 => "java17",
            Runtime::Java21 => "java21",
            Runtime::Rust170 => "rust1.70",
            Runtime::Dotnet6 => "dotnet6",
            Runtime::Dotnet8 => "dotnet8",
        }
    }

    /// Family this runtime belongs to.
    pub fn family(&self) -> RuntimeFamily {
        match self {
            Runtime::Wasm => RuntimeFamily::Wasm,
            Runtime::Python38
            | Runtime::Python39
            | Runtime::Python310
            | Runtime::Python311
            | Runtime::Python312 => RuntimeFamily::Python,
            Runtime::Nodejs16 | Runtime::Nodejs18 | Runtime::Nodejs20 => RuntimeFamily::Node,
            Runtime::Go119 | Runtime::Go120 | Runtime::Go121 => RuntimeFamily::Go,
            Runtime::Java11 | Runtime::Java17 | Runtime::Java21 => RuntimeFamily::Java,
            Runtime::Rust170 => RuntimeFamily::Rust,
            Runtime::Dotnet6 | Runtime::Dotnet8 => RuntimeFamily::Dotnet,
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Runtime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Runtime::ALL
            .iter()
            .copied()
            .find(|runtime| runtime.as_str() == s)
            .ok_or_else(|| Error::UnsupportedRuntime(s.to_string()))
    }
}

/// Deployment status.
///
/// ```text
/// deploying ──▶ building ──┬──▶ deployed
///                          └──▶ failed
/// ```
///
/// `deployed` and `failed` are terminal for a version; creating a new version
/// starts over at `deploying`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Created, waiting for a deployment worker
    Deploying,
    /// A worker is building the current version
    Building,
    /// Build succeeded
    Deployed,
    /// Build failed; see `FunctionRecord::error`
    Failed,
}

impl FunctionStatus {
    /// Whether the machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: FunctionStatus) -> bool {
        matches!(
            (self, next),
            (FunctionStatus::Deploying, FunctionStatus::Building)
                | (FunctionStatus::Building, FunctionStatus::Deployed)
                | (FunctionStatus::Building, FunctionStatus::Failed)
        )
    }

    /// Whether no further transition is possible for this version.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FunctionStatus::Deployed | FunctionStatus::Failed)
    }

    /// Lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Deploying => "deploying",
            FunctionStatus::Building => "building",
            FunctionStatus::Deployed => "deployed",
            FunctionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(FunctionStatus::Deploying),
            "building" => Ok(FunctionStatus::Building),
            "deployed" => Ok(FunctionStatus::Deployed),
            "failed" => Ok(FunctionStatus::Failed),
            _ => Err(format!("Unknown function status: {}", s)),
        }
    }
}

/// Pointer to an immutable artifact.
///
/// Rendered as `{tenant}/{name}/v{version}/{sha256}.zip`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CodeRef {
    /// Owning tenant
    pub tenant_id: String,
    /// Function name
    pub name: String,
    /// Version the artifact was uploaded for
    pub version: u32,
    /// Hex SHA-256 of the bundle bytes
    pub digest: String,
}

impl CodeRef {
    /// Storage key relative to the artifact root.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for CodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/v{}/{}.zip",
            self.tenant_id, self.name, self.version, self.digest
        )
    }
}

impl std::str::FromStr for CodeRef {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("Invalid code reference: {}", s);
        let parts: Vec<&str> = s.split('/').collect();
        let [tenant_id, name, version, file] = parts.as_slice() else {
            return Err(invalid());
        };
        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let digest = file.strip_suffix(".zip").ok_or_else(invalid)?;
        if tenant_id.is_empty() || name.is_empty() || digest.is_empty() {
            return Err(invalid());
        }
        Ok(CodeRef {
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            version,
            digest: digest.to_string(),
        })
    }
}

impl TryFrom<String> for CodeRef {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CodeRef> for String {
    fn from(value: CodeRef) -> Self {
        value.to_string()
    }
}

/// A trigger bound to a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Generated trigger ID
    pub trigger_id: String,
    /// Trigger type, e.g. `http`, `pubsub`, `storage`
    pub trigger_type: String,
    /// Opaque trigger configuration
    pub config: serde_json::Value,
    /// `active` or `inactive`
    pub status: String,
    /// When the trigger was created
    pub created_at: DateTime<Utc>,
}

impl Trigger {
    /// Whether the trigger still counts as a dependent.
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Live metadata for one function of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Generated at creation, never changes
    pub id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Unique within the tenant
    pub name: String,
    /// Declared runtime
    pub runtime: Runtime,
    /// Entry point, `symbol` or `module.symbol`
    pub handler: String,
    /// Advisory memory envelope
    pub memory_mb: u32,
    /// Wall-clock limit, enforced only by the subprocess strategy
    pub timeout_seconds: u32,
    /// Opaque to the platform
    pub environment: HashMap<String, String>,
    /// Free-form description
    pub description: String,
    /// Starts at 1, never decreases
    pub version: u32,
    /// Deployment status of the current version
    pub status: FunctionStatus,
    /// Artifact holding the current version's bundle
    pub code_ref: CodeRef,
    /// Set when the current version is deployed
    pub endpoint: Option<String>,
    /// Set when the current version failed to build
    pub error: Option<String>,
    /// Alias name to version
    pub aliases: BTreeMap<String, u32>,
    /// Bound triggers
    pub triggers: Vec<Trigger>,
    /// Monotonic
    pub invocation_count: u64,
    /// Monotonic
    pub error_count: u64,
    /// When the function was created
    pub created_at: DateTime<Utc>,
    /// Last metadata change
    pub updated_at: DateTime<Utc>,
}

impl FunctionRecord {
    /// Parsed entry point for this record's runtime family.
    pub fn entry_point(&self) -> EntryPoint {
        EntryPoint::parse(&self.handler, self.runtime.family())
    }

    /// Number of aliases and active triggers.
    pub fn dependents(&self) -> (usize, usize) {
        let active_triggers = self.triggers.iter().filter(|t| t.is_active()).count();
        (self.aliases.len(), active_triggers)
    }

    /// Copy-on-write successor: same fields, next version, fresh timestamps,
    /// status back at `deploying`.
    pub fn next_version(&self, description: impl Into<String>) -> FunctionRecord {
        let now = Utc::now();
        FunctionRecord {
            version: self.version + 1,
            description: description.into(),
            status: FunctionStatus::Deploying,
            endpoint: None,
            error: None,
            created_at: now,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Snapshot for the version history.
    pub fn version_snapshot(&self) -> FunctionVersion {
        FunctionVersion {
            tenant_id: self.tenant_id.clone(),
            name: self.name.clone(),
            version: self.version,
            description: self.description.clone(),
            runtime: self.runtime,
            handler: self.handler.clone(),
            code_ref: self.code_ref.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// One entry of a function's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionVersion {
    /// Owning tenant
    pub tenant_id: String,
    /// Function name
    pub name: String,
    /// Version number
    pub version: u32,
    /// Description given when the version was created
    pub description: String,
    /// Runtime at that version
    pub runtime: Runtime,
    /// Handler at that version
    pub handler: String,
    /// Artifact at that version
    pub code_ref: CodeRef,
    /// Status when the version was created
    pub status: FunctionStatus,
    /// When the version was created
    pub created_at: DateTime<Utc>,
}

/// Resolved entry point: file inside the bundle plus the symbol to call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    /// Bundle-relative file name, e.g. `main.py`
    pub file: String,
    /// Handler symbol inside the file
    pub symbol: String,
}

impl EntryPoint {
    /// Parse `symbol` or `module.symbol`.
    pub fn parse(handler: &str, family: RuntimeFamily) -> EntryPoint {
        let (module, symbol) = match handler.rsplit_once('.') {
            Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => {
                (module.replace('.', "/"), symbol)
            }
            _ => (family.default_module().to_string(), handler),
        };
        EntryPoint {
            file: format!("{}.{}", module, family.entry_extension()),
            symbol: symbol.to_string(),
        }
    }
}

/// Check a handler string is `identifier(.identifier)*`.
pub fn validate_handler(handler: &str) -> Result<()> {
    let valid = !handler.is_empty()
        && handler.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!(
            "Invalid handler {:?}: expected identifier or module.identifier",
            handler
        )))
    }
}

/// Check a tenant or function name is safe to use as a path segment.
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 128
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidRequest(format!("Invalid {}: {:?}", kind, value)))
    }
}

/// Builder for new function records.
pub struct FunctionRecordBuilder {
    tenant_id: String,
    name: String,
    runtime: Runtime,
    handler: String,
    memory_mb: u32,
    timeout_seconds: u32,
    environment: HashMap<String, String>,
    description: String,
}

impl FunctionRecordBuilder {
    /// Create a builder with the original platform defaults (512 MB, 30 s).
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        runtime: Runtime,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            name: name.into(),
            runtime,
            handler: handler.into(),
            memory_mb: 512,
            timeout_seconds: 30,
            environment: HashMap::new(),
            description: String::new(),
        }
    }

    /// Set the memory envelope
    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the timeout
    pub fn timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set environment variables
    pub fn environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Build a version-1 record in `deploying` pointing at `code_ref`.
    pub fn build(self, code_ref: CodeRef) -> FunctionRecord {
        let now = Utc::now();
        FunctionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: self.tenant_id,
            name: self.name,
            runtime: self.runtime,
            handler: self.handler,
            memory_mb: self.memory_mb,
            timeout_seconds: self.timeout_seconds,
            environment: self.environment,
            description: self.description,
            version: 1,
            status: FunctionStatus::Deploying,
            code_ref,
            endpoint: None,
            error: None,
            aliases: BTreeMap::new(),
            triggers: Vec::new(),
            invocation_count: 0,
            error_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_ref() -> CodeRef {
        CodeRef {
            tenant_id: "alice".to_string(),
            name: "hello".to_string(),
            version: 1,
            digest: "abc123".to_string(),
        }
    }

    #[test]
    fn test_runtime_round_trips_through_str() {
        for runtime in Runtime::ALL {
            assert_eq!(runtime.as_str().parse::<Runtime>().unwrap(), runtime);
        }
    }

    #[test]
    fn test_unknown_runtime_is_unsupported() {
        let err = "cobol99".parse::<Runtime>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedRuntime(ref r) if r == "cobol99"));
    }

    #[test]
    fn test_runtime_serde_uses_wire_identifier() {
        let json = serde_json::to_string(&Runtime::Python311).unwrap();
        assert_eq!(json, "\"python3.11\"");
        let back: Runtime = serde_json::from_str("\"nodejs20\"").unwrap();
        assert_eq!(back, Runtime::Nodejs20);
    }

    #[test]
    fn test_status_machine() {
        use FunctionStatus::*;
        assert!(Deploying.can_transition_to(Building));
        assert!(Building.can_transition_to(Deployed));
        assert!(Building.can_transition_to(Failed));

        assert!(!Deploying.can_transition_to(Deployed));
        assert!(!Deployed.can_transition_to(Building));
        assert!(!Failed.can_transition_to(Deployed));
        assert!(Deployed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Building.is_terminal());
    }

    #[test]
    fn test_code_ref_parse() {
        let parsed: CodeRef = "alice/hello/v3/deadbeef.zip".parse().unwrap();
        assert_eq!(parsed.tenant_id, "alice");
        assert_eq!(parsed.name, "hello");
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.digest, "deadbeef");
        assert_eq!(parsed.to_string(), "alice/hello/v3/deadbeef.zip");

        assert!("alice/hello/3/deadbeef.zip".parse::<CodeRef>().is_err());
        assert!("alice/hello/v3".parse::<CodeRef>().is_err());
    }

    #[test]
    fn test_entry_point_defaults_per_family() {
        let python = EntryPoint::parse("main", RuntimeFamily::Python);
        assert_eq!(python.file, "main.py");
        assert_eq!(python.symbol, "main");

        let node = EntryPoint::parse("handler", RuntimeFamily::Node);
        assert_eq!(node.file, "index.js");

        let wasm = EntryPoint::parse("app.run", RuntimeFamily::Wasm);
        assert_eq!(wasm.file, "app.wasm");
        assert_eq!(wasm.symbol, "run");

        let nested = EntryPoint::parse("pkg.app.run", RuntimeFamily::Python);
        assert_eq!(nested.file, "pkg/app.py");
    }

    #[test]
    fn test_validate_handler() {
        assert!(validate_handler("main").is_ok());
        assert!(validate_handler("app.handle_event").is_ok());
        assert!(validate_handler("").is_err());
        assert!(validate_handler("main'); import os").is_err());
        assert!(validate_handler("app..main").is_err());
        assert!(validate_handler("1abc").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("name", "hello-world").is_ok());
        assert!(validate_name("tenant", "user@example.com").is_ok());
        assert!(validate_name("name", "../etc").is_err());
        assert!(validate_name("name", "a/b").is_err());
        assert!(validate_name("name", "").is_err());
    }

    #[test]
    fn test_next_version_copies_fields() {
        let mut record = FunctionRecordBuilder::new("alice", "hello", Runtime::Wasm, "main")
            .description("first")
            .build(code_ref());
        record.status = FunctionStatus::Deployed;
        record.endpoint = Some("https://example/alice/hello/v1".to_string());
        record.invocation_count = 7;

        let next = record.next_version("second");
        assert_eq!(next.version, 2);
        assert_eq!(next.description, "second");
        assert_eq!(next.status, FunctionStatus::Deploying);
        assert!(next.endpoint.is_none());
        assert_eq!(next.id, record.id);
        assert_eq!(next.code_ref, record.code_ref);
        assert_eq!(next.invocation_count, 7);
        assert_eq!(next.handler, record.handler);
    }

    #[test]
    fn test_dependents_counts_only_active_triggers() {
        let mut record =
            FunctionRecordBuilder::new("alice", "hello", Runtime::Wasm, "main").build(code_ref());
        record.aliases.insert("prod".to_string(), 1);
        for status in ["active", "inactive"] {
            record.triggers.push(Trigger {
                trigger_id: status.to_string(),
                trigger_type: "http".to_string(),
                config: serde_json::json!({}),
                status: status.to_string(),
                created_at: Utc::now(),
            });
        }
        assert_eq!(record.dependents(), (1, 1));
    }
}
