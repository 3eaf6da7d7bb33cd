//! Local channel: one JSON tool call per input line, one JSON result per output line.
//! Callers here are always the local-channel identity.

use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::dispatch::{Gate, ToolCall};
use crate::error::AppError;
use crate::identity::Identity;

async fn handle_line(gate: &Arc<Gate>, line: &str) -> Value {
    let call: ToolCall = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return AppError::user("bad_request", format!("invalid tool call: {}", e)).to_json(),
    };
    let id = call.id.clone();
    let g = gate.clone();
    let result = tokio::task::spawn_blocking(move || g.call_tool(&Identity::local(), &call.tool, &call.arguments)).await;
    let mut out = match result.map_err(|e| AppError::internal("task_failed", e.to_string())) {
        Ok(r) => serde_json::to_value(r).unwrap_or_else(|e| AppError::internal("encode", e.to_string()).to_json()),
        Err(e) => e.to_json(),
    };
    if let (Some(id), Some(obj)) = (id, out.as_object_mut()) {
        obj.insert("id".to_string(), id);
    }
    out
}

/// Serve until `input` reaches EOF.
pub async fn serve<R, W>(gate: Arc<Gate>, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tracing::info!("serving MCP on the local channel");
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = handle_line(&gate, line).await;
        output.write_all(reply.to_string().as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    tracing::info!("local channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use crate::config::GateConfig;

    fn gate() -> Arc<Gate> {
        let mut cfg = GateConfig::default();
        cfg.backend.host = "mem".into();
        cfg.backend.zone = "z".into();
        cfg.backend.username = "svc".into();
        cfg.backend.password = "pw".into();
        let mem = MemoryConnector::new().with_file("/z/home/svc/hello.txt", "hi");
        Arc::new(Gate::new(cfg, Arc::new(mem)))
    }

    #[tokio::test]
    async fn one_reply_per_line() -> anyhow::Result<()> {
        let input = concat!(
            r#"{"id": 1, "tool": "irods_read_file", "arguments": {"path": "hello.txt"}}"#, "\n",
            "\n",
            "not json\n",
            r#"{"id": "b", "tool": "irods_read_file", "arguments": {"path": "/z/home/other/x"}}"#, "\n",
        );
        let mut out: Vec<u8> = Vec::new();
        serve(gate(), input.as_bytes(), &mut out).await?;
        let replies: Vec<Value> = String::from_utf8(out)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["isError"], false);
        assert!(replies[0]["content"][0]["text"].as_str().unwrap().contains("hi"));
        assert_eq!(replies[1]["code"], "bad_request");
        assert_eq!(replies[2]["id"], "b");
        assert_eq!(replies[2]["isError"], true);
        Ok(())
    }
}
