use crate::state::AppState;
use crate::ws::handler::WsQuery;
use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const RESPONSE_HEAD_LIMIT: usize = 16 * 1024;

/// Remote-desktop tunnel: WebSocket on the client side, raw TCP to the
/// framebuffer exporter on the other. Bytes pass through unmodified; the
/// framebuffer protocol is opaque to the gateway.
pub async fn desktop_tunnel(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    if !state
        .secret
        .authorize_upgrade(&headers, query.token.as_deref())
    {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let port = state.desktop.vnc_port();
    Ok(ws.on_upgrade(move |socket| relay_ws_tcp(socket, port)))
}

/// Full-duplex WS↔TCP relay; either side closing closes the other. An
/// unreachable upstream closes the client with a clear status and is never
/// retried.
async fn relay_ws_tcp(mut socket: WebSocket, port: u16) {
    let upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(port, error = %err, "desktop tunnel upstream unavailable");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 1011,
                    reason: "upstream unavailable".into(),
                })))
                .await;
            return;
        }
    };

    let (mut up_read, mut up_write) = upstream.into_split();
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if up_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if up_write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            read = up_read.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Ok(n) => {
                    if socket
                        .send(Message::Binary(buf[..n].to_vec().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            },
        }
    }
}

/// Dev-server tunnel: relay the client's own upgrade request to the
/// upstream dev server's endpoint, hand back its 101, then splice the two
/// byte streams until either side closes.
pub async fn dev_proxy(State(state): State<AppState>, mut req: Request) -> Response {
    if !state.secret.authorize_http(req.headers()) {
        return status_response(StatusCode::UNAUTHORIZED);
    }

    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let port = state.config.dev_server.port;
    let mut upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(port, error = %err, "dev tunnel upstream unavailable");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    let head = build_request_head(&req, port);
    if upstream.write_all(head.as_bytes()).await.is_err() {
        return status_response(StatusCode::BAD_GATEWAY);
    }

    let (status, upstream_headers, leftover) = match read_response_head(&mut upstream).await {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(port, error = %err, "dev tunnel handshake failed");
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };

    if status != 101 {
        tracing::warn!(port, status, "upstream refused the upgrade");
        return status_response(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        );
    }

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "client upgrade failed");
            }
        }
    });

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in upstream_headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| status_response(StatusCode::BAD_GATEWAY))
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

/// Reconstruct the request head for the upstream, rewriting the host.
fn build_request_head(req: &Request, upstream_port: u16) -> String {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    head.push_str(&format!("Host: 127.0.0.1:{upstream_port}\r\n"));
    for (name, value) in req.headers() {
        if name == axum::http::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("\r\n");
    head
}

/// Read and parse the upstream response head. Returns the status code, the
/// header lines, and any bytes already read past the head (they belong to
/// the upgraded stream).
async fn read_response_head(
    upstream: &mut TcpStream,
) -> anyhow::Result<(u16, Vec<(String, String)>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > RESPONSE_HEAD_LIMIT {
            anyhow::bail!("response head exceeds {} bytes", RESPONSE_HEAD_LIMIT);
        }
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("upstream closed during handshake");
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])?;
    let (status, headers) = parse_response_head(head)?;
    let leftover = buf[head_end + 4..].to_vec();
    Ok((status, headers, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_response_head(head: &str) -> anyhow::Result<(u16, Vec<(String, String)>)> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty response head"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line}"))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((status, headers))
}
