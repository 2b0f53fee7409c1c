//! SOCKS5 client-side framing.
//!
//! Only the no-auth method (0x00) is spoken; targets may be IPv4, IPv6 or
//! domain names. The reply validation is strict: version, reply code,
//! reserved byte and ATYP are all checked, and the bound-address tail must
//! have exactly the ATYP-specific length.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain name accepted in a CONNECT request.
pub const MAX_DOMAIN_LEN: usize = 253;

/// `05 01 00` — version 5, one method, no-auth.
pub fn encode_greeting() -> [u8; 3] {
    [SOCKS_VERSION, 0x01, METHOD_NO_AUTH]
}

pub fn check_method_reply(reply: [u8; 2]) -> Result<()> {
    if reply[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks5(format!("bad version {:#04x}", reply[0])));
    }
    if reply[1] != METHOD_NO_AUTH {
        return Err(ProxyError::Socks5(format!(
            "server requires auth method {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

/// Build a CONNECT request for the target. Literal addresses use the
/// IPv4/IPv6 ATYP; everything else is sent as a domain name.
pub fn encode_connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let mut req = Vec::with_capacity(6 + MAX_DOMAIN_LEN);
    req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > MAX_DOMAIN_LEN {
                return Err(ProxyError::Socks5(format!(
                    "domain name too long ({} bytes)",
                    host.len()
                )));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    Ok(req)
}

/// Read and validate a CONNECT reply. The bound address is consumed but
/// not returned; callers only care that the tunnel is established.
pub async fn read_connect_reply<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(ProxyError::Socks5(format!("bad version {:#04x}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(ProxyError::Socks5(format!("request rejected: code {}", head[1])));
    }
    if head[2] != 0x00 {
        return Err(ProxyError::Socks5(format!("bad reserved byte {:#04x}", head[2])));
    }

    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(ProxyError::Socks5(format!("bad address type {other:#04x}")));
        }
    };

    let mut tail = vec![0u8; addr_len + 2];
    stream.read_exact(&mut tail).await?;
    Ok(())
}

/// Full client handshake over an established stream: greeting, method
/// reply, CONNECT request, CONNECT reply.
pub async fn connect_through<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_greeting()).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    check_method_reply(reply)?;

    let req = encode_connect_request(host, port)?;
    stream.write_all(&req).await?;

    read_connect_reply(stream).await
}
