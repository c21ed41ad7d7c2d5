//! Per-connection protocol state machine.
//!
//! Parses a tolerant HTTP/1.x request off the socket, registers a flow,
//! gates on the intercept flag, applies rules, fetches upstream (or serves a
//! mock), applies response rules, gates again, and writes the response back.
//! `CONNECT` requests divert to the opaque tunnel before any flow exists.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use url::Url;

use crate::bus::Event;
use crate::error::ProxyError;
use crate::flows::{Flow, Scheme};
use crate::proxy::{Decision, ProxyShared, tunnel};
use crate::rules::Phase;

type ClientReader = BufReader<OwnedReadHalf>;

/// Entry point for one accepted client connection.
///
/// Failures inside the pipeline surface as a best-effort `LogMessage`; the
/// writer is closed on every path and the server keeps running.
pub(crate) async fn handle_client(stream: TcpStream, shared: Arc<ProxyShared>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    if let Err(err) = drive(&mut reader, &mut writer, &shared).await {
        tracing::debug!("handler error: {err}");
        shared.bus.publish(Event::LogMessage {
            msg: format!("Handler error: {err}"),
        });
    }
    let _ = writer.shutdown().await;
}

async fn drive(
    reader: &mut ClientReader,
    writer: &mut OwnedWriteHalf,
    shared: &Arc<ProxyShared>,
) -> io::Result<()> {
    let Some(request_line) = read_line(reader).await? else {
        return Ok(());
    };
    let mut tokens = request_line.split_whitespace();
    let (Some(method), Some(target)) = (tokens.next(), tokens.next()) else {
        // Fewer than two tokens: drop silently, no flow.
        return Ok(());
    };
    let method = method.to_string();
    let target = target.to_string();
    let version = tokens.next().unwrap_or("HTTP/1.1").to_string();

    let Some(headers) = read_headers(reader).await? else {
        return Ok(());
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(&target, 80);
        return tunnel::run(reader, writer, &host, port).await;
    }

    let host_header = header_value(&headers, "host").unwrap_or_default().to_string();
    let url = if target.starts_with("http") {
        target.clone()
    } else {
        format!("http://{host_header}{target}")
    };

    let body = match header_value(&headers, "content-length") {
        Some(value) => {
            let len: usize = value.trim().parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length")
            })?;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        }
        None => Bytes::new(),
    };

    let (host, port) = split_host_port(&host_header, 80);
    let mut flow = shared.flows.write().await.new_flow();
    flow.method = method.clone();
    flow.scheme = Scheme::Http;
    flow.host = host;
    flow.port = port;
    flow.path = target.clone();
    flow.request.headers = headers.clone();
    flow.request.body = body.clone();
    flow.request.http_version = version
        .strip_prefix("HTTP/")
        .unwrap_or("1.1")
        .to_string();
    shared.flows.write().await.update(flow.clone());
    shared.bus.publish(Event::FlowCreated { id: flow.id });

    // Snapshot the ruleset at phase entry; a concurrent ApplyRules affects
    // later phases and later flows, never a phase mid-evaluation.
    let ruleset = shared.ruleset.read().await.clone();
    let applied = ruleset.apply(Phase::Request, &url, &method, None, &headers, &body);
    let url = applied.url;
    let request_headers = applied.headers;
    let body = applied.body;
    let mock = applied.mock;

    if shared.intercept.load(Ordering::SeqCst) {
        if await_decision(shared, flow.id, Phase::Request).await == Decision::Drop {
            finish(shared, &mut flow, Some(format!("Dropped by user at {}", Phase::Request))).await;
            return Ok(());
        }
    }

    let (status, response_headers, response_body) = match mock {
        Some(mock) => (mock.status, mock.headers, mock.body),
        None => match fetch_upstream(shared, &method, &url, &request_headers, &body).await {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!("upstream fetch for flow {} failed: {err}", flow.id);
                finish(shared, &mut flow, Some(err.to_string())).await;
                return Ok(());
            }
        },
    };

    let ruleset = shared.ruleset.read().await.clone();
    let applied = ruleset.apply(
        Phase::Response,
        &url,
        &method,
        Some(status),
        &response_headers,
        &response_body,
    );
    let response_headers = applied.headers;
    let response_body = applied.body;

    if shared.intercept.load(Ordering::SeqCst) {
        if await_decision(shared, flow.id, Phase::Response).await == Decision::Drop {
            finish(shared, &mut flow, Some(format!("Dropped by user at {}", Phase::Response))).await;
            return Ok(());
        }
    }

    flow.response.headers = response_headers.clone();
    flow.response.body = response_body.clone();
    flow.status_code = Some(status);
    flow.size = response_body.len();
    shared.flows.write().await.update(flow.clone());
    shared.bus.publish(Event::FlowUpdated { id: flow.id });

    write_response(writer, status, &response_headers, &response_body).await?;

    finish(shared, &mut flow, None).await;
    Ok(())
}

/// Serialize the response: synthesized `OK` reason phrase, headers in order,
/// and a computed `Content-Length` appended when upstream supplied none.
async fn write_response(
    writer: &mut OwnedWriteHalf,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) -> io::Result<()> {
    let mut out = Vec::with_capacity(body.len() + 256);
    out.extend_from_slice(format!("HTTP/1.1 {status} OK\r\n").as_bytes());
    for (name, value) in headers {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    let has_length = headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-length"));
    if !has_length {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Issue the (possibly rewritten) request upstream. Redirects are never
/// followed; every status is carried through.
async fn fetch_upstream(
    shared: &Arc<ProxyShared>,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: &Bytes,
) -> Result<(u16, Vec<(String, String)>, Bytes), ProxyError> {
    let target = Url::parse(url).map_err(|source| ProxyError::UpstreamUrl {
        url: url.to_string(),
        source,
    })?;
    let method =
        reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);

    let mut request = shared.client.request(method, target);
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        request = request.body(body.to_vec());
    }

    let response = request
        .send()
        .await
        .map_err(|source| ProxyError::Upstream { source })?;
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|source| ProxyError::Upstream { source })?;
    Ok((status, headers, body))
}

/// Install a one-shot decision slot, announce the pause, and wait.
///
/// The slot is installed before `FlowPaused` is published so a decision can
/// never arrive ahead of its waiter. An unanswered gate resolves as Forward
/// once the configured timeout elapses, or waits indefinitely without one.
async fn await_decision(shared: &Arc<ProxyShared>, flow_id: u64, phase: Phase) -> Decision {
    let (tx, rx) = oneshot::channel();
    shared.pending.lock().await.insert(flow_id, tx);
    shared.bus.publish(Event::FlowPaused { id: flow_id, phase });

    let decision = match shared.decision_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) | Err(_) => Decision::Forward,
        },
        None => rx.await.unwrap_or(Decision::Forward),
    };
    shared.pending.lock().await.remove(&flow_id);
    decision
}

/// Record the terminal state and publish `FlowFinished`.
async fn finish(shared: &Arc<ProxyShared>, flow: &mut Flow, error: Option<String>) {
    if error.is_some() {
        flow.error = error;
    }
    flow.finished_at = Some(Utc::now());
    shared.flows.write().await.update(flow.clone());
    shared.bus.publish(Event::FlowFinished { id: flow.id });
}

/// Read one line, tolerating lone `\n` and non-UTF-8 bytes. `None` on EOF.
async fn read_line(reader: &mut ClientReader) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read headers until a blank line, splitting each on the first colon with
/// whitespace trimmed. `None` when a line has no colon.
async fn read_headers(reader: &mut ClientReader) -> io::Result<Option<Vec<(String, String)>>> {
    let mut headers = Vec::new();
    loop {
        let Some(line) = read_line(reader).await? else {
            break;
        };
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Ok(None);
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Some(headers))
}

/// First value for a case-insensitive header name.
fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Split `host[:port]`, falling back to `default_port` when the port is
/// absent or unparsable. Bracketed IPv6 literals are not handled.
fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        None => (host.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_handles_explicit_port() {
        assert_eq!(
            split_host_port("example.com:8443", 80),
            ("example.com".to_string(), 8443)
        );
    }

    #[test]
    fn split_host_port_defaults_when_absent_or_bad() {
        assert_eq!(
            split_host_port("example.com", 80),
            ("example.com".to_string(), 80)
        );
        assert_eq!(
            split_host_port("example.com:http", 80),
            ("example.com:http".to_string(), 80)
        );
    }

    #[test]
    fn header_value_is_case_insensitive() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Content-Length".to_string(), "4".to_string()),
        ];
        assert_eq!(header_value(&headers, "host"), Some("example.com"));
        assert_eq!(header_value(&headers, "CONTENT-LENGTH"), Some("4"));
        assert_eq!(header_value(&headers, "accept"), None);
    }
}
