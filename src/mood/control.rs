//! HTTP control surface of the server
//!
//! `GET /` serves a help page listing the known moods and
//! `GET /effect?name=<mood>` activates a mood locally and broadcasts it.
//! The listener speaks just enough HTTP/1.1 for browsers and curl: one
//! request per connection, no bodies. The request head is capped at 8 KiB
//! (413 beyond that) and the request line must be exactly
//! `METHOD TARGET HTTP/1.x` (400 otherwise).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::network::ServerHandle;
use crate::protocol::MAX_PAYLOAD_SIZE;

use super::renderer::Renderer;

/// Largest request head accepted
const MAX_REQUEST_LEN: usize = 8 * 1024;

/// An HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Response {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into(),
        }
    }

    fn html(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/html",
            body,
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            _ => "Internal Server Error",
        }
    }

    /// Serialize with a `Connection: close` header
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

/// Decode `%XX` escapes and `+`; `None` on malformed escapes or bad UTF-8
fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                if !hex.iter().all(u8::is_ascii_hexdigit) {
                    return None;
                }
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

/// Method and target of a `METHOD TARGET HTTP/1.x` request line
fn parse_request_line(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split(' ');
    let (method, target, version) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || method.is_empty() || !target.starts_with('/') {
        return None;
    }
    if !matches!(version, "HTTP/1.0" | "HTTP/1.1") {
        return None;
    }
    Some((method, target))
}

/// Value of `key` in a query string
fn query_value(query: &str, key: &str) -> Option<Option<String>> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
}

/// Request handler for the control endpoints
#[derive(Clone)]
pub struct ControlSurface {
    renderer: Arc<dyn Renderer>,
    server: ServerHandle,
}

impl ControlSurface {
    pub fn new(renderer: Arc<dyn Renderer>, server: ServerHandle) -> Self {
        Self { renderer, server }
    }

    /// Route one request
    pub fn handle(&self, method: &str, target: &str) -> Response {
        if method != "GET" {
            return Response::text(405, "Only GET is supported.");
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        match path {
            "/" => Response::html(self.help_page()),
            "/effect" => match query {
                Some(query) => self.set_effect(query),
                None => Response::text(404, "Nothing matches the given URI"),
            },
            _ => Response::text(404, "Nothing matches the given URI"),
        }
    }

    fn set_effect(&self, query: &str) -> Response {
        let name = match query_value(query, "name") {
            Some(Some(name)) if !name.is_empty() => name,
            Some(None) => return Response::text(400, "Request parameter 'name' is malformed."),
            _ => return Response::text(400, "Request parameter 'name' is missing."),
        };
        if name.len() >= MAX_PAYLOAD_SIZE || name.contains('\0') {
            return Response::text(400, "Request parameter 'name' is too long.");
        }

        self.renderer.set_mood(&name);
        match self.server.broadcast_update(&name) {
            Ok(_) => Response::text(200, name),
            Err(e) => {
                error!("Broadcasting mood '{}' failed: {}", name, e);
                Response::text(500, "Broadcast failed")
            }
        }
    }

    fn help_page(&self) -> String {
        let items: String = self
            .renderer
            .moods()
            .iter()
            .map(|m| format!("<li><a href='/effect?name={0}'>{0}</a></li>", m))
            .collect();
        format!(
            "<!DOCTYPE html>\
             <html><head><title>Mood Effects</title></head>\
             <body>\
             <h1>Mood Effects Control</h1>\
             <p>Available effects:</p>\
             <ul>{}</ul>\
             <p>Use <code>/effect?name=EFFECT</code> to activate an effect.</p>\
             </body></html>",
            items
        )
    }

    /// Accept connections until the listener fails
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!("HTTP control listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            let surface = self.clone();
            tokio::spawn(async move {
                if let Err(e) = surface.serve_connection(stream, peer).await {
                    debug!("HTTP connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn serve_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(1024);
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break Some(end);
            }
            if buf.len() > MAX_REQUEST_LEN {
                break None;
            }
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let response = match head_end {
            Some(end) => {
                let head = String::from_utf8_lossy(&buf[..end]);
                let line = head.split("\r\n").next().unwrap_or_default();
                match parse_request_line(line) {
                    Some((method, target)) => {
                        debug!("{} {} from {}", method, target, peer);
                        self.handle(method, target)
                    }
                    None => Response::text(400, "Malformed request line"),
                }
            }
            None => {
                warn!("Request head from {} too large", peer);
                Response::text(413, "Request too large")
            }
        };

        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await
    }
}
