#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// A shell MCP server good enough for handshake + tools traffic: answers
/// each request line with a canned response carrying the request's id, and
/// echoes `msg` back from tool calls. Extra argv is ignored, so distinct
/// launch strings can share one script.
pub const STUB_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case $line in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"stub","version":"0.0.0"}}}\n' "$id" ;;
    *'"method":"notifications/initialized"'*)
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo a message","inputSchema":{"type":"object","properties":{"msg":{"type":"string"}}}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      msg=$(printf '%s' "$line" | sed -n 's/.*"msg":"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"%s"}]}}\n' "$id" "$msg" ;;
    *)
      ;;
  esac
done
"#;

pub fn write_stub(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("stub-server.sh");
    std::fs::write(&path, STUB_SERVER).expect("write stub server");
    path
}

/// Launch string for the stub; `tag` varies the canonical form (and so the
/// ServerId) without changing behavior.
pub fn stub_command_line(path: &Path, tag: Option<&str>) -> String {
    match tag {
        Some(tag) => format!("sh {} {tag}", path.display()),
        None => format!("sh {}", path.display()),
    }
}
