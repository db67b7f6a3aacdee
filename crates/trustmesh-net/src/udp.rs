//! UDP socket construction.
//!
//! Sockets are built through `socket2` so that reuse flags are set
//! before bind, then handed to tokio for async I/O.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Largest payload a single UDP datagram can carry.
pub const MAX_DATAGRAM: usize = 65_507;

/// Bind a UDP socket on a well-known service port.
pub fn bind(ip: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

/// Bind an ephemeral-port socket for request/reply exchanges.
pub fn bind_ephemeral(ip: Ipv4Addr) -> io::Result<UdpSocket> {
    bind(ip, 0)
}

/// Build a v4 destination for `send_to`.
pub fn dest(ip: Ipv4Addr, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bound_sockets_exchange_datagrams() {
        let a = bind_ephemeral(Ipv4Addr::LOCALHOST).unwrap();
        let b = bind_ephemeral(Ipv4Addr::LOCALHOST).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
