//! Listener construction and the SOCKS5 wire codec.

pub mod socks;

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::Result;

/// Bind a listening socket with `SO_REUSEADDR` so a restart does not trip
/// over sockets in TIME_WAIT.
pub fn create_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(tokio::net::TcpListener::from_std(std_listener)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_binds_and_accepts() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr);
        let (accepted, _) = tokio::join!(listener.accept(), client);
        accepted.unwrap();
    }
}
