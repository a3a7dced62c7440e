//! JSON-lines tool endpoint.
//!
//! One request per input line:
//!
//! ```text
//! {"id": 1, "tool": "execute", "args": {"command": "ls -la"}}
//! ```
//!
//! While a command runs, each output line is emitted as
//! `{"id": 1, "event": "output", "line": "..."}`; the call then finishes with
//! `{"id": 1, "ok": true, "result": {...}}` or
//! `{"id": 1, "ok": false, "error": {"kind": "...", "message": "..."}}`.
//! Requests are handled strictly one at a time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, GateError};
use crate::gate::{CommandGate, OutputSink};

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub args: Args,
}

#[derive(Debug, Default, Deserialize)]
pub struct Args {
    pub command: Option<String>,
    pub safety_override_reason: Option<String>,
    pub accept_risk: Option<bool>,
    pub user_confirmation: Option<String>,
    pub duration: Option<String>,
}

impl Args {
    fn command(&self) -> Result<&str, GateError> {
        self.command
            .as_deref()
            .ok_or_else(|| GateError::InvalidRequest("missing argument: command".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

/// Dispatch one tool call against the gate.
pub async fn dispatch(
    gate: &mut CommandGate,
    tool: &str,
    args: &Args,
    sink: OutputSink,
) -> Result<Value, GateError> {
    let value = match tool {
        "execute" => to_value(gate.submit(args.command()?, Some(sink)).await?),
        "execute_with_override" => {
            let reason = args.safety_override_reason.as_deref().unwrap_or_default();
            let accept_risk = args.accept_risk.unwrap_or(false);
            to_value(
                gate.submit_with_override(args.command()?, reason, accept_risk, Some(sink))
                    .await?,
            )
        }
        "check_permission_status" => to_value(gate.permission_status(args.command()?)),
        "approve_command" => {
            let confirmation = args.user_confirmation.as_deref().unwrap_or_default();
            let duration = args.duration.as_deref().unwrap_or("session");
            to_value(gate.approve(args.command()?, confirmation, duration)?)
        }
        "get_working_directory" => {
            json!({ "cwd": gate.working_directory()?.to_string_lossy() })
        }
        "reset_session" => to_value(gate.reset_session().await?),
        "view_override_history" => json!({ "overrides": gate.override_history() }),
        other => {
            return Err(GateError::InvalidRequest(format!("unknown tool: {}", other)));
        }
    };
    Ok(value)
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| json!({ "serialization_error": e.to_string() }))
}

async fn write_line<W: AsyncWrite + Unpin>(out: &mut W, value: &Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    out.write_all(&line).await?;
    out.flush().await?;
    Ok(())
}

/// Serve requests from `input` until EOF.
pub async fn serve<R, W>(gate: &mut CommandGate, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request: {}", e);
                let body = ErrorBody {
                    kind: ErrorKind::InvalidRequest,
                    message: format!("malformed request: {}", e),
                };
                write_line(&mut output, &json!({ "id": Value::Null, "ok": false, "error": body }))
                    .await?;
                continue;
            }
        };
        debug!("Tool call {} ({})", request.tool, request.id);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let id = request.id.clone();
        let call = dispatch(gate, &request.tool, &request.args, tx);
        let forward = async {
            while let Some(chunk) = rx.recv().await {
                write_line(
                    &mut output,
                    &json!({ "id": id, "event": "output", "line": chunk }),
                )
                .await?;
            }
            Ok::<(), anyhow::Error>(())
        };
        let (outcome, forwarded) = tokio::join!(call, forward);
        forwarded?;

        let response = match outcome {
            Ok(result) => json!({ "id": request.id, "ok": true, "result": result }),
            Err(e) => {
                info!("Tool call {} rejected: {}", request.tool, e);
                let body = ErrorBody {
                    kind: e.kind(),
                    message: e.to_string(),
                };
                json!({ "id": request.id, "ok": false, "error": body })
            }
        };
        write_line(&mut output, &response).await?;
    }

    info!("Input closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::audit::AuditSink;
    use crate::gate::GateOptions;
    use crate::security::PermissionBucketStore;
    use crate::shell::testing::{Script, ScriptedSpawner};

    fn gate(dir: &tempfile::TempDir) -> CommandGate {
        let perm = dir.path().join("perm.json");
        std::fs::write(
            &perm,
            r#"{"always_allow": ["ls", "tail"], "always_ask": ["rm"], "always_block": ["vim"]}"#,
        )
        .unwrap();
        let spawner = ScriptedSpawner::new(|cmd| match cmd {
            "tail -f app.log" => Script::Hang(vec!["waiting".into()]),
            _ => Script::Output(vec!["a".into(), "b".into()]),
        });
        CommandGate::new(
            Arc::new(PermissionBucketStore::open(perm).unwrap()),
            AuditSink::open(dir.path()).unwrap(),
            Arc::new(spawner.clone()),
            GateOptions::default(),
            spawner.clock(),
        )
        .unwrap()
    }

    async fn run(input: &str) -> Vec<Value> {
        let dir = tempfile::tempdir().unwrap();
        let mut gate = gate(&dir);
        let mut out: Vec<u8> = Vec::new();
        serve(&mut gate, input.as_bytes(), &mut out).await.unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_execute_streams_then_responds() {
        let out = run(r#"{"id": 7, "tool": "execute", "args": {"command": "ls"}}"#).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["event"], "output");
        assert_eq!(out[0]["line"], "a");
        assert_eq!(out[1]["line"], "b");
        assert_eq!(out[2]["id"], 7);
        assert_eq!(out[2]["ok"], true);
        assert_eq!(out[2]["result"]["output"], "a\nb");
    }

    #[tokio::test]
    async fn test_timeout_kind_in_result() {
        let out = run(r#"{"id": 3, "tool": "execute", "args": {"command": "tail -f app.log"}}"#)
            .await;
        let response = out.last().unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"]["success"], false);
        assert_eq!(response["result"]["output"], "waiting");
        assert_eq!(response["result"]["error_kind"]["kind"], "timeout_exceeded");
        assert_eq!(response["result"]["error_kind"]["reason"], "output_timeout");
    }

    #[tokio::test]
    async fn test_denial_carries_kind() {
        let out = run(
            "{\"id\": 1, \"tool\": \"execute\", \"args\": {\"command\": \"rm -rf /\"}}\n\
             {\"id\": 2, \"tool\": \"execute\", \"args\": {\"command\": \"rm x\"}}\n",
        )
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["ok"], false);
        assert_eq!(out[0]["error"]["kind"]["kind"], "dangerous_pattern");
        assert_eq!(out[1]["error"]["kind"]["kind"], "permission_denied");
    }

    #[tokio::test]
    async fn test_status_history_and_cwd() {
        let out = run(
            "{\"id\": 1, \"tool\": \"check_permission_status\", \"args\": {\"command\": \"rm\"}}\n\
             {\"id\": 2, \"tool\": \"view_override_history\"}\n\
             {\"id\": 3, \"tool\": \"get_working_directory\"}\n",
        )
        .await;
        assert_eq!(out[0]["result"]["status"], "always_ask");
        assert_eq!(out[0]["result"]["can_override"], true);
        assert_eq!(out[1]["result"]["overrides"], json!([]));
        assert!(out[2]["result"]["cwd"].is_string());
    }

    #[tokio::test]
    async fn test_bad_input_does_not_stop_server() {
        let out = run(
            "not json\n\
             {\"id\": 2, \"tool\": \"launch_missiles\"}\n\
             {\"id\": 3, \"tool\": \"execute\"}\n\
             {\"id\": 4, \"tool\": \"reset_session\"}\n",
        )
        .await;
        assert_eq!(out.len(), 4);
        assert_eq!(out[0]["error"]["kind"]["kind"], "invalid_request");
        assert!(out[1]["error"]["message"].as_str().unwrap().contains("unknown tool"));
        assert!(out[2]["error"]["message"].as_str().unwrap().contains("command"));
        assert_eq!(out[3]["ok"], true);
    }
}
