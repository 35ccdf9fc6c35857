//! Front-end session loop: one JSON-RPC message per line, strictly in order.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use crate::mcp_client::types::{error_codes, ServerResponse};

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The front-end closed its input.
    Eof,
    /// Shutdown was requested.
    Cancelled,
}

/// Serve requests from `reader` until EOF or cancellation.
///
/// Each response is written as a single line and flushed before the next
/// request is read. A line that is not UTF-8 is answered with a parse error.
/// Only I/O failures end the session with an error.
pub async fn serve<R, W>(
    dispatcher: &Dispatcher,
    mut reader: R,
    mut writer: W,
    cancel: &CancellationToken,
) -> std::io::Result<SessionEnd>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    tracing::info!("serving front-end on stdio");

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            read = reader.read_until(b'\n', &mut buf) => read?,
        };
        if read == 0 {
            tracing::info!("front-end closed stdin");
            return Ok(SessionEnd::Eof);
        }

        let response = match std::str::from_utf8(&buf) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::trace!(direction = "in", message = %line, "front-end traffic");
                dispatcher.handle_line(line).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "front-end message is not UTF-8");
                Some(ServerResponse::error(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {e}"),
                    None,
                ))
            }
        };
        let Some(response) = response else {
            continue;
        };

        let mut out = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        tracing::trace!(direction = "out", message = %out, "front-end traffic");
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, BufReader};

    use crate::mcp_client::testing::ready_connection;
    use crate::mcp_client::types::BackendSpec;
    use crate::mcp_client::{Aggregator, SupervisorSettings};

    async fn dispatcher() -> Dispatcher {
        let aggregator = Arc::new(Aggregator::new(SupervisorSettings::default()));
        let (conn, _) = ready_connection(BackendSpec::new("test-server", "fake"), &["echo"]).await;
        aggregator.admit(conn).await;
        Dispatcher::new(aggregator, None)
    }

    fn parse_lines(output: &[u8]) -> Vec<Value> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_serve_answers_in_order_and_skips_notifications() {
        let dispatcher = dispatcher().await;
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#, "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, "\n",
            "\n",
            "   \n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#, "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"test_server_echo","arguments":{"message":"hi"}}}"#, "\n",
            "garbage\n",
        );
        let mut output = Vec::new();
        let end = serve(&dispatcher, input.as_bytes(), &mut output, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Eof);

        let responses = parse_lines(&output);
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"]["tools"][0]["name"], "test_server_echo");
        assert_eq!(responses[2]["id"], 3);
        assert_eq!(responses[2]["result"]["echo"]["name"], "echo");
        assert_eq!(responses[3]["id"], Value::Null);
        assert_eq!(responses[3]["error"]["code"], -32700);
        for response in &responses {
            assert_eq!(response["jsonrpc"], "2.0");
        }
    }

    #[tokio::test]
    async fn test_serve_answers_undecodable_line_and_keeps_going() {
        let dispatcher = dispatcher().await;
        let input: &[u8] = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"x\xff\"}\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n";
        let mut output = Vec::new();
        let end = serve(&dispatcher, input, &mut output, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Eof);

        let responses = parse_lines(&output);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_serve_answers_batch_with_invalid_request() {
        let dispatcher = dispatcher().await;
        let input = concat!(
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#, "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#, "\n",
        );
        let mut output = Vec::new();
        serve(&dispatcher, input.as_bytes(), &mut output, &CancellationToken::new())
            .await
            .unwrap();

        let responses = parse_lines(&output);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], -32600);
        assert_eq!(responses[1]["id"], 2);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let dispatcher = dispatcher().await;
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let end = serve(&dispatcher, BufReader::new(server_read), server_write, &cancel)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Cancelled);
        drop(client);
    }

    #[tokio::test]
    async fn test_serve_over_duplex_pipe() {
        let dispatcher = Arc::new(dispatcher().await);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);

        let session = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                serve(
                    &dispatcher,
                    BufReader::new(server_read),
                    server_write,
                    &CancellationToken::new(),
                )
                .await
            })
        };

        client
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":\"p\",\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["id"], "p");
        assert!(response["result"].is_object());

        drop(client);
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Eof);
    }
}
