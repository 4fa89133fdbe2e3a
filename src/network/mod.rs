use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::BindError;

/// Creates and configures a UDP socket for packet-arrival detection.
/// Binds `(bind_ip, port)` and joins `group` on that interface when one is given.
pub fn create_udp_socket(
    bind_ip: &str,
    port: u16,
    group: Option<Ipv4Addr>,
) -> Result<Socket, BindError> {
    if port == 0 {
        return Err(BindError::InvalidPort(port));
    }
    let iface: Ipv4Addr = bind_ip
        .trim()
        .parse()
        .map_err(|_| BindError::InvalidAddress(bind_ip.to_string()))?;
    let sock_addr = SocketAddr::new(IpAddr::V4(iface), port);
    let addr = sock_addr.to_string();

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|source| BindError::Io { addr: addr.clone(), source })?;
    socket
        .set_reuse_address(true)
        .map_err(|source| BindError::Io { addr: addr.clone(), source })?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|source| BindError::Io { addr: addr.clone(), source })?;
    socket
        .bind(&sock_addr.into())
        .map_err(|source| classify_bind_error(&addr, port, source))?;

    // A failed join still leaves unicast delivery working, so it is not fatal
    if let Some(group) = group.filter(|g| g.is_multicast()) {
        match socket.join_multicast_v4(&group, &iface) {
            Ok(()) => debug!(%group, %iface, "joined multicast group"),
            Err(err) => warn!(%group, %iface, error = %err, "failed to join multicast group"),
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|source| BindError::Io { addr, source })?;
    Ok(socket)
}

fn classify_bind_error(addr: &str, port: u16, source: io::Error) -> BindError {
    match source.kind() {
        io::ErrorKind::AddrInUse => BindError::PortInUse {
            addr: addr.to_string(),
            port,
        },
        io::ErrorKind::AddrNotAvailable => BindError::AddressUnavailable {
            addr: addr.to_string(),
            source,
        },
        _ => BindError::Io {
            addr: addr.to_string(),
            source,
        },
    }
}
