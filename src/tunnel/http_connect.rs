//! HTTP CONNECT connector

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::Address;
use crate::error::TunnelError;
use crate::router::TunnelKind;

use super::connector::{connect_tcp, Connector, Upstream};

/// Upper bound on the proxy's response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Relay through an upstream proxy after a CONNECT handshake
pub struct HttpConnect {
    proxy: Address,
    target: Address,
    username: Option<String>,
    password: Option<String>,
}

impl HttpConnect {
    pub fn new(proxy: Address, target: Address) -> Self {
        Self {
            proxy,
            target,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    fn requires_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Build the CONNECT request naming the original destination
    fn request(&self) -> String {
        let target = self.target.authority();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);

        if self.requires_auth() {
            let auth = format!(
                "{}:{}",
                self.username.as_deref().unwrap_or(""),
                self.password.as_deref().unwrap_or("")
            );
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", BASE64.encode(auth)));
        }

        request.push_str("\r\n");
        request
    }
}

#[async_trait]
impl Connector for HttpConnect {
    async fn connect(&self) -> Result<Upstream, TunnelError> {
        let mut stream = connect_tcp(&self.proxy).await?;

        stream
            .write_all(self.request().as_bytes())
            .await
            .map_err(|e| TunnelError::connect(&self.proxy, &e))?;

        // Read until the end of the response head; anything after it is tunnel data
        let mut buf = BytesMut::with_capacity(1024);
        let (status, head_len) = loop {
            if let Some(parsed) = parse_response_head(&buf)? {
                break parsed;
            }
            if buf.len() >= MAX_RESPONSE_HEAD {
                return Err(TunnelError::Protocol(format!(
                    "CONNECT response head exceeds {} bytes",
                    MAX_RESPONSE_HEAD
                )));
            }

            // Still connecting: a dropped proxy means the upstream was unreachable
            let n = stream
                .read_buf(&mut buf)
                .await
                .map_err(|e| TunnelError::connect(&self.proxy, &e))?;
            if n == 0 {
                return Err(TunnelError::Protocol(
                    "Proxy closed the connection before the CONNECT response".into(),
                ));
            }
        };

        debug!(
            "CONNECT {} via {} answered {}",
            self.target, self.proxy, status
        );

        let early_data = buf.split_off(head_len);
        Ok(Upstream { stream, early_data })
    }

    fn kind(&self) -> TunnelKind {
        TunnelKind::HttpConnect
    }

    fn dial_address(&self) -> &Address {
        &self.proxy
    }
}

/// Parse a CONNECT response head.
///
/// Returns `Ok(None)` while the head is incomplete, the status code and head
/// length once it is complete and 2xx, and a protocol error otherwise.
fn parse_response_head(buf: &[u8]) -> Result<Option<(u16, usize)>, TunnelError> {
    let head_end = match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None => return Ok(None),
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| TunnelError::Protocol("CONNECT response is not valid UTF-8".into()))?;
    let status_line = head.lines().next().unwrap_or("").trim();

    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(TunnelError::Protocol(format!(
            "Invalid HTTP response: {}",
            status_line
        )));
    }

    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TunnelError::Protocol(format!("Invalid status code: {}", status_line)))?;

    if !(200..300).contains(&status) {
        return Err(TunnelError::Protocol(format!(
            "HTTP CONNECT failed: {}",
            status_line
        )));
    }

    Ok(Some((status, head_end)))
}
