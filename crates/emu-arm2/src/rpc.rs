//! JSON-RPC 2.0 debugging facade over stdin/stdout.
//!
//! One request per line, one response per line. Sessions are created and
//! addressed by id; every response carries either a structured result or
//! a structured error with code and message. Memory payloads travel as
//! base64.

#![allow(clippy::too_many_lines, clippy::match_same_arms)]

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use machine_arm2::{
    Event, RunPolicy, Session, SessionManager, StopReason, VmConfig, WatchMode,
};

// ---------------------------------------------------------------------------
// JSON-RPC types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: JsonValue,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: JsonValue,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn success(id: JsonValue, result: JsonValue) -> Self {
        Self { jsonrpc: "2.0", result: Some(result), error: None, id }
    }

    fn error(id: JsonValue, code: i32, message: String) -> Self {
        Self { jsonrpc: "2.0", result: None, error: Some(RpcError { code, message }), id }
    }
}

const INVALID_PARAMS: i32 = -32602;
const SERVER_ERROR: i32 = -32000;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct RpcServer {
    sessions: SessionManager,
}

impl RpcServer {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: SessionManager::new() }
    }

    /// Serve requests until stdin closes.
    pub fn run(&self) {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut stdout = stdout.lock();

        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let request: RpcRequest = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        RpcResponse::error(JsonValue::Null, -32700, format!("Parse error: {e}"));
                    Self::send(&mut stdout, &resp);
                    continue;
                }
            };
            if request.jsonrpc != "2.0" {
                let resp = RpcResponse::error(
                    request.id,
                    -32600,
                    "Invalid JSON-RPC version".to_string(),
                );
                Self::send(&mut stdout, &resp);
                continue;
            }

            let response = self.dispatch(&request.method, &request.params, request.id.clone());
            Self::send(&mut stdout, &response);
        }
    }

    fn send(stdout: &mut impl Write, response: &RpcResponse) {
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(response).unwrap_or_default()
        );
        let _ = stdout.flush();
    }

    fn dispatch(&self, method: &str, params: &JsonValue, id: JsonValue) -> RpcResponse {
        match method {
            "create_session" => self.handle_create(params, id),
            "destroy_session" => self.handle_destroy(params, id),
            "load" => self.with_session(params, id, handle_load),
            "run" => self.with_session(params, id, handle_run),
            "stop" => self.with_session(params, id, |s, _| {
                s.stop();
                Ok(json!({"status": "ok"}))
            }),
            "step" => self.with_session(params, id, |s, _| {
                Ok(stop_to_json(&s.step(), s))
            }),
            "reset" => self.with_session(params, id, |s, _| {
                s.reset();
                Ok(json!({"status": "ok", "state": s.state().to_string()}))
            }),
            "registers" => self.with_session(params, id, |s, _| Ok(registers_to_json(s))),
            "write_register" => self.with_session(params, id, handle_write_register),
            "read_memory" => self.with_session(params, id, handle_read_memory),
            "write_memory" => self.with_session(params, id, handle_write_memory),
            "disassemble" => self.with_session(params, id, handle_disassemble),
            "evaluate" => self.with_session(params, id, handle_evaluate),
            "list_breakpoints" => self.with_session(params, id, |s, _| {
                let list: Vec<JsonValue> = s
                    .breakpoints()
                    .iter()
                    .map(|b| {
                        json!({
                            "id": b.id,
                            "address": b.addr,
                            "enabled": b.enabled,
                            "hits": b.hits,
                            "condition": b.condition,
                            "temporary": b.temporary,
                        })
                    })
                    .collect();
                Ok(json!({"breakpoints": list}))
            }),
            "add_breakpoint" => self.with_session(params, id, handle_add_breakpoint),
            "add_watchpoint" => self.with_session(params, id, handle_add_watchpoint),
            "remove_breakpoint" => self.with_session(params, id, handle_remove_breakpoint),
            "enable_breakpoint" => self.with_session(params, id, |s, p| {
                handle_enable_breakpoint(s, p, true)
            }),
            "disable_breakpoint" => self.with_session(params, id, |s, p| {
                handle_enable_breakpoint(s, p, false)
            }),
            "send_stdin" => self.with_session(params, id, handle_send_stdin),
            "events" => self.with_session(params, id, |s, _| {
                let events: Vec<JsonValue> = s.drain_events().iter().map(event_to_json).collect();
                Ok(json!({"events": events}))
            }),
            _ => RpcResponse::error(id, -32601, format!("Unknown method: {method}")),
        }
    }

    fn handle_create(&self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let mut config = VmConfig::default();
        if let Some(v) = params.get("maxCycles").and_then(JsonValue::as_u64) {
            config.max_cycles = v;
        }
        if let Some(v) = params.get("stackSize").and_then(JsonValue::as_u64) {
            config.stack_size = v as u32;
        }
        if let Some(v) = params.get("heapSize").and_then(JsonValue::as_u64) {
            config.heap_size = v as u32;
        }
        if let Some(v) = params.get("memorySize").and_then(JsonValue::as_u64) {
            config.memory_size = v as u32;
        }
        if let Some(v) = params.get("fsRoot").and_then(JsonValue::as_str) {
            config.fs_root = Some(PathBuf::from(v));
        }
        if let Some(v) = params.get("strictAlignment").and_then(JsonValue::as_bool) {
            config.strict_alignment = v;
        }
        if let Some(v) = params.get("stepsBeforeYield").and_then(JsonValue::as_u64) {
            config.steps_before_yield = v as u32;
        }
        if let Some(list) = params.get("args").and_then(JsonValue::as_array) {
            config.args = list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        match self.sessions.create(config) {
            Ok(session_id) => RpcResponse::success(id, json!({"sessionId": session_id})),
            Err(e) => RpcResponse::error(id, INVALID_PARAMS, e.to_string()),
        }
    }

    fn handle_destroy(&self, params: &JsonValue, id: JsonValue) -> RpcResponse {
        let Some(session_id) = params.get("sessionId").and_then(JsonValue::as_u64) else {
            return RpcResponse::error(id, INVALID_PARAMS, "Missing 'sessionId'".to_string());
        };
        if self.sessions.destroy(session_id) {
            RpcResponse::success(id, json!({"status": "ok"}))
        } else {
            RpcResponse::error(id, SERVER_ERROR, format!("No session {session_id}"))
        }
    }

    fn with_session(
        &self,
        params: &JsonValue,
        id: JsonValue,
        handler: impl Fn(&Arc<Session>, &JsonValue) -> Result<JsonValue, (i32, String)>,
    ) -> RpcResponse {
        let Some(session_id) = params.get("sessionId").and_then(JsonValue::as_u64) else {
            return RpcResponse::error(id, INVALID_PARAMS, "Missing 'sessionId'".to_string());
        };
        let Some(session) = self.sessions.get(session_id) else {
            return RpcResponse::error(id, SERVER_ERROR, format!("No session {session_id}"));
        };
        match handler(&session, params) {
            Ok(result) => RpcResponse::success(id, result),
            Err((code, message)) => RpcResponse::error(id, code, message),
        }
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point used by `main --rpc`.
pub fn serve() {
    RpcServer::new().run();
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

type HandlerResult = Result<JsonValue, (i32, String)>;

fn need_u32(params: &JsonValue, key: &str) -> Result<u32, (i32, String)> {
    params
        .get(key)
        .and_then(JsonValue::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| (INVALID_PARAMS, format!("Missing or invalid '{key}'")))
}

fn handle_load(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let Some(source) = params.get("source").and_then(JsonValue::as_str) else {
        return Err((INVALID_PARAMS, "Missing 'source'".to_string()));
    };
    let name = params.get("name").and_then(JsonValue::as_str).unwrap_or("<facade>");
    match session.load_source(source, name) {
        Ok(()) => Ok(json!({"status": "ok", "state": session.state().to_string()})),
        Err(machine_arm2::LoadError::Assemble(diags)) => {
            let errors: Vec<JsonValue> = diags
                .iter()
                .map(|d| {
                    json!({
                        "file": d.pos.file,
                        "line": d.pos.line,
                        "column": d.pos.column,
                        "message": d.message,
                        "suggestion": d.suggestion,
                    })
                })
                .collect();
            Ok(json!({"status": "error", "errors": errors}))
        }
        Err(machine_arm2::LoadError::Layout(message)) => Err((SERVER_ERROR, message)),
    }
}

fn handle_run(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let policy = match params.get("policy").and_then(JsonValue::as_str) {
        None | Some("continue") => RunPolicy::Continue,
        Some("step_over") => RunPolicy::StepOver,
        Some("finish") => RunPolicy::Finish,
        Some(other) => {
            return Err((INVALID_PARAMS, format!("Unknown policy '{other}'")));
        }
    };
    let reason = session.run(policy);
    Ok(stop_to_json(&reason, session))
}

fn handle_write_register(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let index = need_u32(params, "register")?;
    if index > 15 {
        return Err((INVALID_PARAMS, "Register index must be 0-15".to_string()));
    }
    let value = need_u32(params, "value")?;
    session.write_register(index as usize, value);
    Ok(json!({"status": "ok"}))
}

fn handle_read_memory(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let address = need_u32(params, "address")?;
    let length = need_u32(params, "length")?;
    let bytes = session.read_memory(address, length);
    Ok(json!({
        "address": address,
        "length": bytes.len(),
        "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
    }))
}

fn handle_write_memory(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let address = need_u32(params, "address")?;
    let Some(data) = params.get("data").and_then(JsonValue::as_str) else {
        return Err((INVALID_PARAMS, "Missing 'data'".to_string()));
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| (INVALID_PARAMS, format!("Invalid base64: {e}")))?;
    session
        .write_memory(address, &bytes)
        .map_err(|f| (SERVER_ERROR, f.to_string()))?;
    Ok(json!({"status": "ok"}))
}

fn handle_disassemble(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let address = need_u32(params, "address")?;
    let count = need_u32(params, "count")?;
    let lines: Vec<JsonValue> = session
        .disassemble(address, count)
        .iter()
        .map(|line| {
            json!({
                "address": line.addr,
                "machineCode": format!("{:08X}", line.word),
                "mnemonic": line.text,
                "symbol": line.symbol.as_ref().map(|(name, offset)| {
                    if *offset == 0 {
                        name.clone()
                    } else {
                        format!("{name}+0x{offset:X}")
                    }
                }),
            })
        })
        .collect();
    Ok(json!({"instructions": lines}))
}

fn handle_evaluate(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let Some(expression) = params.get("expression").and_then(JsonValue::as_str) else {
        return Err((INVALID_PARAMS, "Missing 'expression'".to_string()));
    };
    match session.evaluate(expression) {
        Ok(value) => Ok(json!({"value": value, "hex": format!("0x{:X}", value)})),
        Err(message) => Err((SERVER_ERROR, message)),
    }
}

fn handle_add_breakpoint(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let address = need_u32(params, "address")?;
    let condition = params
        .get("condition")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let id = session.add_breakpoint(address, condition);
    Ok(json!({"id": id}))
}

fn handle_add_watchpoint(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let address = need_u32(params, "address")?;
    let length = need_u32(params, "length").unwrap_or(4);
    let mode = match params.get("mode").and_then(JsonValue::as_str) {
        Some("read") => WatchMode::Read,
        None | Some("write") => WatchMode::Write,
        Some("access") => WatchMode::Access,
        Some(other) => return Err((INVALID_PARAMS, format!("Unknown mode '{other}'"))),
    };
    let condition = params
        .get("condition")
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let id = session.add_watchpoint(address, length, mode, condition);
    Ok(json!({"id": id}))
}

fn handle_remove_breakpoint(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let id = need_u32(params, "id")?;
    if session.remove_breakpoint(id) {
        Ok(json!({"status": "ok"}))
    } else {
        Err((SERVER_ERROR, format!("No breakpoint {id}")))
    }
}

fn handle_enable_breakpoint(
    session: &Arc<Session>,
    params: &JsonValue,
    enabled: bool,
) -> HandlerResult {
    let id = need_u32(params, "id")?;
    if session.set_breakpoint_enabled(id, enabled) {
        Ok(json!({"status": "ok"}))
    } else {
        Err((SERVER_ERROR, format!("No breakpoint {id}")))
    }
}

fn handle_send_stdin(session: &Arc<Session>, params: &JsonValue) -> HandlerResult {
    let bytes = if let Some(b64) = params.get("data").and_then(JsonValue::as_str) {
        base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| (INVALID_PARAMS, format!("Invalid base64: {e}")))?
    } else if let Some(text) = params.get("text").and_then(JsonValue::as_str) {
        text.as_bytes().to_vec()
    } else {
        return Err((INVALID_PARAMS, "Provide 'data' (base64) or 'text'".to_string()));
    };
    session.send_input(&bytes);
    Ok(json!({"queued": bytes.len()}))
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

fn registers_to_json(session: &Arc<Session>) -> JsonValue {
    let regs = session.registers();
    let r: Vec<JsonValue> = regs.r.iter().map(|v| json!(v)).collect();
    json!({
        "r": r,
        "flags": {"n": regs.n, "z": regs.z, "c": regs.c, "v": regs.v},
        "cycles": regs.cycles,
        "state": session.state().to_string(),
    })
}

fn stop_to_json(reason: &StopReason, session: &Arc<Session>) -> JsonValue {
    let reason_json = match reason {
        StopReason::Step => json!({"kind": "step"}),
        StopReason::Breakpoint { id, addr } => {
            json!({"kind": "breakpoint", "id": id, "address": addr})
        }
        StopReason::Watchpoint { id, addr } => {
            json!({"kind": "watchpoint", "id": id, "address": addr})
        }
        StopReason::Halted { code } => json!({"kind": "halted", "exitCode": code}),
        StopReason::Error(error) => json!({"kind": "error", "message": error.to_string()}),
        StopReason::Cancelled => json!({"kind": "cancelled"}),
    };
    json!({
        "reason": reason_json,
        "state": session.state().to_string(),
        "registers": registers_to_json(session),
    })
}

fn event_to_json(event: &Event) -> JsonValue {
    match event {
        Event::StateChange { state } => json!({"type": "state", "state": state.to_string()}),
        Event::Output { bytes } => json!({
            "type": "output",
            "data": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
        Event::Debug { text } => json!({"type": "debug", "text": text}),
        Event::BreakpointHit { id, addr } => {
            json!({"type": "breakpoint_hit", "id": id, "address": addr})
        }
        Event::WatchpointHit { id, addr } => {
            json!({"type": "watchpoint_hit", "id": id, "address": addr})
        }
        Event::ProgramHalted { code } => json!({"type": "program_halted", "exitCode": code}),
        Event::Error { message } => json!({"type": "error", "message": message}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_session(server: &RpcServer) -> u64 {
        let resp = server.dispatch("create_session", &json!({}), json!(1));
        resp.result
            .expect("session created")
            .get("sessionId")
            .and_then(JsonValue::as_u64)
            .expect("session id")
    }

    #[test]
    fn unknown_method_returns_error() {
        let server = RpcServer::new();
        let resp = server.dispatch("nonexistent", &JsonValue::Null, json!(1));
        assert!(resp.error.is_some());
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32601));
    }

    #[test]
    fn missing_session_returns_error() {
        let server = RpcServer::new();
        let resp = server.dispatch("registers", &json!({"sessionId": 99}), json!(1));
        assert!(resp.error.is_some());
    }

    #[test]
    fn load_run_and_read_registers() {
        let server = RpcServer::new();
        let id = create_session(&server);

        let resp = server.dispatch(
            "load",
            &json!({"sessionId": id, "source": "MOV R0, #7\nSWI #0\n"}),
            json!(2),
        );
        let result = resp.result.expect("load ok");
        assert_eq!(result.get("status").and_then(JsonValue::as_str), Some("ok"));

        let resp = server.dispatch("run", &json!({"sessionId": id}), json!(3));
        let result = resp.result.expect("run ok");
        assert_eq!(
            result.pointer("/reason/kind").and_then(JsonValue::as_str),
            Some("halted")
        );
        assert_eq!(
            result.pointer("/reason/exitCode").and_then(JsonValue::as_u64),
            Some(7)
        );
        assert_eq!(
            result.pointer("/registers/r/0").and_then(JsonValue::as_u64),
            Some(7)
        );
    }

    #[test]
    fn load_reports_structured_diagnostics() {
        let server = RpcServer::new();
        let id = create_session(&server);
        let resp = server.dispatch(
            "load",
            &json!({"sessionId": id, "source": "MOW R0, #1\n"}),
            json!(2),
        );
        let result = resp.result.expect("structured error result");
        assert_eq!(result.get("status").and_then(JsonValue::as_str), Some("error"));
        let errors = result.get("errors").and_then(JsonValue::as_array).expect("errors");
        assert!(!errors.is_empty());
        assert_eq!(errors[0].get("line").and_then(JsonValue::as_u64), Some(1));
    }

    #[test]
    fn memory_round_trips_as_base64() {
        let server = RpcServer::new();
        let id = create_session(&server);
        let _ = server.dispatch(
            "load",
            &json!({"sessionId": id, "source": "SWI #0\n.data\nbuf: .skip 8\n"}),
            json!(2),
        );
        let resp = server.dispatch(
            "evaluate",
            &json!({"sessionId": id, "expression": "buf"}),
            json!(3),
        );
        let buf_addr = resp
            .result
            .expect("evaluate ok")
            .get("value")
            .and_then(JsonValue::as_u64)
            .expect("address");

        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let resp = server.dispatch(
            "write_memory",
            &json!({"sessionId": id, "address": buf_addr, "data": data}),
            json!(4),
        );
        assert!(resp.error.is_none());

        let resp = server.dispatch(
            "read_memory",
            &json!({"sessionId": id, "address": buf_addr, "length": 4}),
            json!(5),
        );
        let result = resp.result.expect("read ok");
        let b64 = result.get("data").and_then(JsonValue::as_str).expect("data");
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(b64).expect("base64"),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn breakpoint_lifecycle_over_rpc() {
        let server = RpcServer::new();
        let id = create_session(&server);
        let _ = server.dispatch(
            "load",
            &json!({"sessionId": id, "source": "MOV R0, #0\nloop: ADD R0, R0, #1\nCMP R0, #5\nBNE loop\nSWI #0\n"}),
            json!(2),
        );
        let resp = server.dispatch(
            "add_breakpoint",
            &json!({"sessionId": id, "address": 0x8004, "condition": "R0 == 3"}),
            json!(3),
        );
        let bp = resp.result.expect("added").get("id").and_then(JsonValue::as_u64).expect("id");

        let resp = server.dispatch("run", &json!({"sessionId": id}), json!(4));
        let result = resp.result.expect("run ok");
        assert_eq!(
            result.pointer("/reason/kind").and_then(JsonValue::as_str),
            Some("breakpoint")
        );

        let resp = server.dispatch(
            "remove_breakpoint",
            &json!({"sessionId": id, "id": bp}),
            json!(5),
        );
        assert!(resp.error.is_none());

        let resp = server.dispatch("run", &json!({"sessionId": id}), json!(6));
        assert_eq!(
            resp.result
                .expect("run ok")
                .pointer("/reason/kind")
                .and_then(JsonValue::as_str),
            Some("halted")
        );
    }

    #[test]
    fn events_stream_in_order() {
        let server = RpcServer::new();
        let id = create_session(&server);
        let _ = server.dispatch(
            "load",
            &json!({"sessionId": id, "source": "MOV R0, #65\nSWI #1\nMOV R0, #0\nSWI #0\n"}),
            json!(2),
        );
        let _ = server.dispatch("run", &json!({"sessionId": id}), json!(3));
        let resp = server.dispatch("events", &json!({"sessionId": id}), json!(4));
        let result = resp.result.expect("events");
        let events = result.get("events").and_then(JsonValue::as_array).expect("array");
        let types: Vec<&str> = events
            .iter()
            .filter_map(|e| e.get("type").and_then(JsonValue::as_str))
            .collect();
        let output_at = types.iter().position(|t| *t == "output").expect("output event");
        let halt_at = types.iter().position(|t| *t == "program_halted").expect("halt event");
        assert!(output_at < halt_at, "output precedes halt: {types:?}");
    }
}
