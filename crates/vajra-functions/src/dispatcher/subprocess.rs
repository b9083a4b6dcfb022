// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subprocess strategy.
//!
//! Writes the payload and a generated wrapper program into the workspace, then
//! runs the wrapper with the runtime's interpreter. The wrapper loads the
//! user's entry file, calls the handler and prints one JSON envelope as its
//! last line of stdout:
//!
//! ```text
//! {"success": true, "result": ...}
//! {"success": false, "error": "...", "kind": "handler_not_found"}
//! ```
//!
//! The child runs in its own process group with the function's
//! `timeout_seconds` as a hard limit; on expiry the whole group is killed.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ExecutionError, ExecutionErrorKind, HandlerLoader, Workspace};
use crate::model::{EntryPoint, FunctionRecord};

const PAYLOAD_FILE: &str = "__vajra_payload.json";

const PYTHON_WRAPPER: &str = r#"import importlib.util
import json
import sys
import traceback

ENTRY = __ENTRY__
SYMBOL = __SYMBOL__


def emit(envelope):
    sys.stdout.write("\n" + json.dumps(envelope) + "\n")
    sys.stdout.flush()


def run():
    with open(__PAYLOAD__) as f:
        payload = json.load(f)
    spec = importlib.util.spec_from_file_location("vajra_function", ENTRY)
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    handler = getattr(module, SYMBOL, None)
    if not callable(handler):
        emit({"success": False, "kind": "handler_not_found",
              "error": "Handler '%s' not found in %s" % (SYMBOL, ENTRY)})
        return
    try:
        result = handler(payload)
    except Exception as e:
        sys.stderr.write(traceback.format_exc())
        emit({"success": False, "error": str(e)})
        return
    emit({"success": True, "result": result})


run()
"#;

const NODE_WRAPPER: &str = r#"const fs = require("fs");
const path = require("path");

const ENTRY = __ENTRY__;
const SYMBOL = __SYMBOL__;

function emit(envelope) {
  process.stdout.write("\n" + JSON.stringify(envelope) + "\n");
}

(async () => {
  const payload = JSON.parse(fs.readFileSync(path.join(__dirname, __PAYLOAD__), "utf8"));
  const mod = require(path.join(__dirname, ENTRY));
  let handler = null;
  if (mod && typeof mod[SYMBOL] === "function") {
    handler = mod[SYMBOL];
  } else if (typeof mod === "function") {
    handler = mod;
  }
  if (!handler) {
    emit({ success: false, kind: "handler_not_found", error: `Handler '${SYMBOL}' not found in ${ENTRY}` });
    return;
  }
  try {
    const result = await handler(payload);
    emit({ success: true, result: result === undefined ? null : result });
  } catch (e) {
    process.stderr.write(String((e && e.stack) || e));
    emit({ success: false, error: e && e.message ? e.message : String(e) });
  }
})().then(
  () => process.exit(0),
  (e) => {
    process.stderr.write(String((e && e.stack) || e));
    process.exit(1);
  },
);
"#;

/// Interpreted runtime run as a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubprocessRuntime {
    /// CPython
    Python,
    /// Node.js
    Node,
}

impl SubprocessRuntime {
    fn wrapper_file(&self) -> &'static str {
        match self {
            SubprocessRuntime::Python => "__vajra_wrapper.py",
            SubprocessRuntime::Node => "__vajra_wrapper.js",
        }
    }

    fn interpreter_args(&self) -> &'static [&'static str] {
        match self {
            SubprocessRuntime::Python => &["-B"],
            SubprocessRuntime::Node => &[],
        }
    }

    /// Wrapper source for an entry point. Names are embedded as JSON string
    /// literals, which both languages accept.
    fn wrapper_source(&self, entry: &EntryPoint) -> Result<String, ExecutionError> {
        let literal = |s: &str| {
            serde_json::to_string(s)
                .map_err(|e| ExecutionError::failure(format!("Failed to encode wrapper: {}", e)))
        };
        let template = match self {
            SubprocessRuntime::Python => PYTHON_WRAPPER,
            SubprocessRuntime::Node => NODE_WRAPPER,
        };
        Ok(template
            .replace("__ENTRY__", &literal(&entry.file)?)
            .replace("__SYMBOL__", &literal(&entry.symbol)?)
            .replace("__PAYLOAD__", &literal(PAYLOAD_FILE)?))
    }
}

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

/// Runs handlers through an interpreter executable.
pub struct SubprocessLoader {
    runtime: SubprocessRuntime,
    interpreter: String,
}

impl SubprocessLoader {
    /// Loader using `interpreter` (a path or a name on `PATH`).
    pub fn new(runtime: SubprocessRuntime, interpreter: impl Into<String>) -> Self {
        Self {
            runtime,
            interpreter: interpreter.into(),
        }
    }

    fn command(&self, record: &FunctionRecord, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(self.runtime.interpreter_args())
            .arg(self.runtime.wrapper_file())
            .current_dir(workspace.path())
            .env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workspace.path())
            .env("LANG", "C.UTF-8")
            .envs(&record.environment)
            .env("VAJRA_FUNCTION_NAME", &record.name)
            .env("VAJRA_FUNCTION_VERSION", record.version.to_string())
            .env("VAJRA_MEMORY_MB", record.memory_mb.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        cmd
    }
}

#[async_trait]
impl HandlerLoader for SubprocessLoader {
    fn strategy(&self) -> &'static str {
        "subprocess"
    }

    async fn invoke(
        &self,
        record: &FunctionRecord,
        workspace: &Workspace,
        payload: &Value,
    ) -> Result<Value, ExecutionError> {
        let entry = record.entry_point();
        if !tokio::fs::try_exists(workspace.file(&entry.file))
            .await
            .unwrap_or(false)
        {
            return Err(ExecutionError::handler_not_found(format!(
                "Entry file '{}' not found in bundle",
                entry.file
            )));
        }

        let payload = serde_json::to_vec(payload)
            .map_err(|e| ExecutionError::failure(format!("Failed to encode payload: {}", e)))?;
        let io_err = |e: std::io::Error| ExecutionError::failure(format!("Workspace write failed: {}", e));
        tokio::fs::write(workspace.file(PAYLOAD_FILE), payload)
            .await
            .map_err(io_err)?;
        tokio::fs::write(
            workspace.file(self.runtime.wrapper_file()),
            self.runtime.wrapper_source(&entry)?,
        )
        .await
        .map_err(io_err)?;

        let child = self.command(record, workspace).spawn().map_err(|e| {
            ExecutionError::failure(format!(
                "Failed to start interpreter '{}': {}",
                self.interpreter, e
            ))
        })?;
        let pid = child.id();
        let limit = Duration::from_secs(u64::from(record.timeout_seconds.max(1)));

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutionError::failure(format!(
                    "Failed to wait for handler process: {}",
                    e
                )));
            }
            Err(_) => {
                if let Some(pid) = pid {
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        debug!(pid, error = %e, "Process group already gone");
                    }
                }
                warn!(
                    function = %record.name,
                    timeout_seconds = record.timeout_seconds,
                    "Handler timed out, killed process group"
                );
                return Err(ExecutionError::new(
                    ExecutionErrorKind::Timeout,
                    format!("Function timed out after {} seconds", record.timeout_seconds),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ExecutionError::failure(format!(
                "Handler process exited with {}",
                output.status
            ))
            .with_stderr(stderr));
        }

        let envelope: Envelope = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| {
                ExecutionError::failure("Handler process produced no result envelope")
                    .with_stderr(stderr.clone())
            })?;

        if envelope.success {
            return Ok(envelope.result);
        }
        let message = envelope
            .error
            .unwrap_or_else(|| "Handler failed without a message".to_string());
        let kind = match envelope.kind.as_deref() {
            Some("handler_not_found") => ExecutionErrorKind::HandlerNotFound,
            _ => ExecutionErrorKind::HandlerError,
        };
        Err(ExecutionError::new(kind, message).with_stderr(stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RuntimeFamily;

    #[test]
    fn test_wrapper_embeds_names_as_literals() {
        let entry = EntryPoint::parse("app.handle", RuntimeFamily::Python);
        let source = SubprocessRuntime::Python.wrapper_source(&entry).unwrap();
        assert!(source.contains(r#"ENTRY = "app.py""#));
        assert!(source.contains(r#"SYMBOL = "handle""#));
        assert!(source.contains(r#"open("__vajra_payload.json")"#));
        assert!(!source.contains("__ENTRY__"));

        let entry = EntryPoint::parse("handler", RuntimeFamily::Node);
        let source = SubprocessRuntime::Node.wrapper_source(&entry).unwrap();
        assert!(source.contains(r#"const ENTRY = "index.js";"#));
        assert!(source.contains(r#"const SYMBOL = "handler";"#));
    }

    #[test]
    fn test_envelope_parsing() {
        let ok: Envelope = serde_json::from_str(r#"{"success":true,"result":{"a":1}}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.result["a"], 1);

        let missing: Envelope = serde_json::from_str(
            r#"{"success":false,"kind":"handler_not_found","error":"Handler 'x' not found in main.py"}"#,
        )
        .unwrap();
        assert!(!missing.success);
        assert_eq!(missing.kind.as_deref(), Some("handler_not_found"));
    }
}
