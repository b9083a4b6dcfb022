// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process WebAssembly strategy.
//!
//! The entry file is a core wasm module exporting:
//!
//! - `memory`
//! - `alloc(len: i32) -> i32`, returning a buffer for the JSON payload
//! - the handler, `(ptr: i32, len: i32) -> i64`, returning the JSON result
//!   location packed as `(out_ptr << 32) | out_len`
//!
//! Each invocation gets a fresh `Store`, so handlers share no state. There is
//! no wall-clock limit: a handler that never returns blocks its invocation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use wasmtime::{Engine, Linker, Module, Store, Trap};

use super::{ExecutionError, ExecutionErrorKind, HandlerLoader, Workspace};
use crate::model::FunctionRecord;

/// Runs wasm handlers on a blocking thread of the host process.
#[derive(Clone, Default)]
pub struct WasmLoader {
    engine: Engine,
}

impl WasmLoader {
    /// Loader with a default engine configuration.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HandlerLoader for WasmLoader {
    fn strategy(&self) -> &'static str {
        "wasm"
    }

    async fn invoke(
        &self,
        record: &FunctionRecord,
        workspace: &Workspace,
        payload: &Value,
    ) -> Result<Value, ExecutionError> {
        let entry = record.entry_point();
        let wasm = match tokio::fs::read(workspace.file(&entry.file)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutionError::handler_not_found(format!(
                    "Entry file '{}' not found in bundle",
                    entry.file
                )));
            }
            Err(e) => {
                return Err(ExecutionError::failure(format!(
                    "Failed to read {}: {}",
                    entry.file, e
                )));
            }
        };
        let input = serde_json::to_vec(payload)
            .map_err(|e| ExecutionError::failure(format!("Failed to encode payload: {}", e)))?;

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            run_module(&engine, &wasm, &entry.file, &entry.symbol, &input)
        })
        .await
        .map_err(|e| ExecutionError::failure(format!("Handler task aborted: {}", e)))?
    }
}

fn trap_message(error: &wasmtime::Error) -> String {
    match error.downcast_ref::<Trap>() {
        Some(trap) => trap.to_string(),
        None => error.root_cause().to_string(),
    }
}

fn run_module(
    engine: &Engine,
    wasm: &[u8],
    file: &str,
    symbol: &str,
    input: &[u8],
) -> Result<Value, ExecutionError> {
    let module = Module::new(engine, wasm)
        .map_err(|e| ExecutionError::failure(format!("Failed to compile {}: {}", file, e)))?;
    let mut store = Store::new(engine, ());
    let linker: Linker<()> = Linker::new(engine);
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| ExecutionError::failure(format!("Failed to instantiate {}: {}", file, e)))?;

    let handler = instance.get_func(&mut store, symbol).ok_or_else(|| {
        ExecutionError::handler_not_found(format!("Handler '{}' not found in {}", symbol, file))
    })?;
    let handler = handler
        .typed::<(i32, i32), i64>(&store)
        .map_err(|e| {
            ExecutionError::failure(format!("Handler '{}' has an unexpected signature: {}", symbol, e))
        })?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| ExecutionError::failure(format!("{} has no 'memory' export", file)))?;
    let alloc = instance
        .get_typed_func::<(i32,), i32>(&mut store, "alloc")
        .map_err(|e| ExecutionError::failure(format!("Missing 'alloc' export: {}", e)))?;

    let len = i32::try_from(input.len())
        .map_err(|_| ExecutionError::failure("Payload too large for wasm32"))?;
    let ptr = alloc
        .call(&mut store, (len,))
        .map_err(|e| ExecutionError::failure(format!("alloc trapped: {}", trap_message(&e))))?;
    memory
        .write(&mut store, ptr as usize, input)
        .map_err(|e| ExecutionError::failure(format!("Payload write out of bounds: {}", e)))?;

    let packed = handler.call(&mut store, (ptr, len)).map_err(|e| {
        ExecutionError::new(ExecutionErrorKind::HandlerError, trap_message(&e))
    })?;

    let packed = packed as u64;
    let out_ptr = (packed >> 32) as usize;
    let out_len = (packed & 0xFFFF_FFFF) as usize;
    let data = memory.data(&store);
    let output = out_ptr
        .checked_add(out_len)
        .and_then(|end| data.get(out_ptr..end))
        .ok_or_else(|| {
            ExecutionError::failure(format!(
                "Result at {}+{} lies outside guest memory of {} bytes",
                out_ptr,
                out_len,
                data.len()
            ))
        })?;

    debug!(file, symbol, output_len = out_len, "wasm handler returned");

    serde_json::from_slice(output)
        .map_err(|e| ExecutionError::failure(format!("Handler returned invalid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $heap (mut i32) (i32.const 1024))
          (func (export "alloc") (param $len i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $len)))
            (local.get $ptr))
          (func (export "main") (param $ptr i32) (param $len i32) (result i64)
            (i64.or
              (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
              (i64.extend_i32_u (local.get $len))))
          (func (export "boom") (param i32 i32) (result i64)
            unreachable)
          (func (export "wrong") (result i32)
            (i32.const 0))
          (func (export "overrun") (param i32 i32) (result i64)
            (i64.const 4294967295)))
    "#;

    #[test]
    fn test_echo_round_trips_payload() {
        let engine = Engine::default();
        let input = br#"{"name":"Vajra"}"#;
        let output = run_module(&engine, ECHO.as_bytes(), "main.wasm", "main", input).unwrap();
        assert_eq!(output, serde_json::json!({"name": "Vajra"}));
    }

    #[test]
    fn test_missing_export_is_handler_not_found() {
        let engine = Engine::default();
        let err = run_module(&engine, ECHO.as_bytes(), "main.wasm", "absent", b"{}").unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::HandlerNotFound);
        assert!(err.message.contains("absent"));
    }

    #[test]
    fn test_trap_is_handler_error() {
        let engine = Engine::default();
        let err = run_module(&engine, ECHO.as_bytes(), "main.wasm", "boom", b"{}").unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::HandlerError);
        assert!(err.message.contains("unreachable"));
    }

    #[test]
    fn test_bad_signature_and_bad_module_are_failures() {
        let engine = Engine::default();
        let err = run_module(&engine, ECHO.as_bytes(), "main.wasm", "wrong", b"{}").unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ExecutionFailure);

        let err = run_module(&engine, b"\0asm garbage", "main.wasm", "main", b"{}").unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ExecutionFailure);
    }

    #[test]
    fn test_result_outside_memory_is_failure() {
        let engine = Engine::default();
        let err = run_module(&engine, ECHO.as_bytes(), "main.wasm", "overrun", b"{}").unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::ExecutionFailure);
        assert!(err.message.contains("outside guest memory"));
    }
}
