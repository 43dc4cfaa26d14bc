//! SOCKS5 acceptor (RFC 1928, no authentication, CONNECT only)

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{Destination, Result};
use crate::error::Error;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Reply with an all-zero IPv4 bind address
async fn reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Run the SOCKS5 handshake and return the requested destination.
///
/// Success is replied before any upstream exists, so upstream failures look
/// like a closed connection to the client.
pub async fn handshake<S>(stream: &mut S) -> Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1. Read version and auth methods
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "Unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    // 2. Only "no authentication" is offered
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Error::Protocol("No acceptable auth method".into()));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // 3. Read request
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("Invalid SOCKS version in request".into()));
    }

    let cmd = header[1];
    let atyp = header[3];

    // 4. Parse address
    let destination = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Destination::from_ip(Ipv4Addr::from(addr).into(), port)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::Protocol("Domain is not valid UTF-8".into()))?;
            Destination::unresolved(domain, port)
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Destination::from_ip(Ipv6Addr::from(addr).into(), port)
        }
        _ => {
            reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(Error::Protocol(format!(
                "Unsupported address type: {}",
                atyp
            )));
        }
    };

    // 5. Only CONNECT is relayed
    if cmd != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!("Unsupported command: {}", cmd)));
    }

    reply(stream, REP_SUCCESS).await?;
    Ok(destination)
}
