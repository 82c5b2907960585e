//! IPv4 addressing and socket setup.
//!
//! Addresses are plain 32-bit values in network byte order, matching what
//! goes into a `sockaddr_in`. Parsing accepts `"a.b.c.d"` for addresses
//! and `"a.b.c.d:port"` for address-port pairs and nothing else.

use std::fmt;
use std::io;
use std::str::FromStr;

use crate::fd::Fd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Tcp,
    Udp,
}

/// An IPv4 address in network byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpAddress(pub u32);

impl IpAddress {
    pub const fn from_octets(o0: u8, o1: u8, o2: u8, o3: u8) -> Self {
        Self(o0 as u32 | (o1 as u32) << 8 | (o2 as u32) << 16 | (o3 as u32) << 24)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in &mut octets {
            let part = parts.next()?;
            if part.is_empty() || part.len() > 3 {
                return None;
            }
            *octet = part.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self::from_octets(octets[0], octets[1], octets[2], octets[3]))
    }

    fn octet(&self, i: u32) -> u8 {
        (self.0 >> (8 * i)) as u8
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.octet(0),
            self.octet(1),
            self.octet(2),
            self.octet(3)
        )
    }
}

impl FromStr for IpAddress {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Self::parse(s).ok_or(())
    }
}

/// An IPv4 address plus a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpAddressPort {
    pub address: IpAddress,
    pub port: u16,
}

impl IpAddressPort {
    pub const fn new(address: IpAddress, port: u16) -> Self {
        Self { address, port }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (addr, port) = s.split_once(':')?;
        if port.is_empty() {
            return None;
        }
        Some(Self {
            address: IpAddress::parse(addr)?,
            port: port.parse().ok()?,
        })
    }

    pub fn to_sockaddr(&self) -> libc::sockaddr_in {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_addr.s_addr = self.address.0;
        sa.sin_port = self.port.to_be();
        sa
    }

    pub fn from_sockaddr(sa: &libc::sockaddr_in) -> Self {
        Self {
            address: IpAddress(sa.sin_addr.s_addr),
            port: u16::from_be(sa.sin_port),
        }
    }
}

impl fmt::Display for IpAddressPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for IpAddressPort {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Self::parse(s).ok_or(())
    }
}

/// Create an unbound socket of the given type.
pub fn create_socket(ty: SocketType) -> io::Result<Fd> {
    let kind = match ty {
        SocketType::Tcp => libc::SOCK_STREAM,
        SocketType::Udp => libc::SOCK_DGRAM,
    };
    let fd = unsafe { libc::socket(libc::AF_INET, kind | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Fd::new(fd))
}

pub fn bind(fd: &Fd, addr: &IpAddressPort) -> io::Result<()> {
    let sa = addr.to_sockaddr();
    let ret = unsafe {
        libc::bind(
            fd.raw(),
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Create a socket bound to `addr`, optionally with `SO_REUSEADDR`.
pub fn create_socket_bound(
    ty: SocketType,
    addr: &IpAddressPort,
    reuse_addr: bool,
) -> io::Result<Fd> {
    let fd = create_socket(ty)?;
    if reuse_addr {
        let opt: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd.raw(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
    bind(&fd, addr)?;
    Ok(fd)
}

/// Create a TCP socket bound to `addr` and listening.
pub fn create_tcp_listen_socket(addr: &IpAddressPort, backlog: i32) -> io::Result<Fd> {
    let fd = create_socket_bound(SocketType::Tcp, addr, true)?;
    if unsafe { libc::listen(fd.raw(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// The locally bound address of a socket. Useful after binding to port 0.
pub fn local_addr(fd: &Fd) -> io::Result<IpAddressPort> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd.raw(),
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(IpAddressPort::from_sockaddr(&sa))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address() {
        assert_eq!(
            IpAddress::parse("127.0.0.1"),
            Some(IpAddress::from_octets(127, 0, 0, 1))
        );
        assert_eq!(IpAddress::parse("0.0.0.0"), Some(IpAddress(0)));
        assert_eq!(
            IpAddress::parse("255.255.255.255"),
            Some(IpAddress(u32::MAX))
        );
    }

    #[test]
    fn parse_address_rejects() {
        for s in [
            "", "1", "1.2.3", "1.2.3.4.5", "256.0.0.1", "a.b.c.d", "1.2.3.4:80", "1..3.4",
            "1.2.3.0004",
        ] {
            assert_eq!(IpAddress::parse(s), None, "accepted {s:?}");
        }
    }

    #[test]
    fn parse_address_port() {
        let ap = IpAddressPort::parse("127.0.0.1:4242").unwrap();
        assert_eq!(ap.address, IpAddress::from_octets(127, 0, 0, 1));
        assert_eq!(ap.port, 4242);
    }

    #[test]
    fn parse_address_port_rejects() {
        for s in ["127.0.0.1", "127.0.0.1:", "127.0.0.1:65536", ":80", "1.2.3.4:-1"] {
            assert_eq!(IpAddressPort::parse(s), None, "accepted {s:?}");
        }
    }

    #[test]
    fn display_round_trip() {
        for s in ["0.0.0.0", "127.0.0.1", "10.1.2.3"] {
            assert_eq!(IpAddress::parse(s).unwrap().to_string(), s);
        }
        let s = "192.168.0.1:8080";
        assert_eq!(IpAddressPort::parse(s).unwrap().to_string(), s);
    }

    #[test]
    fn sockaddr_round_trip() {
        let ap = IpAddressPort::parse("10.0.0.7:9999").unwrap();
        assert_eq!(IpAddressPort::from_sockaddr(&ap.to_sockaddr()), ap);
    }

    #[test]
    fn listen_socket_gets_a_port() {
        let addr = IpAddressPort::parse("127.0.0.1:0").unwrap();
        let fd = create_tcp_listen_socket(&addr, 16).unwrap();
        let bound = local_addr(&fd).unwrap();
        assert_ne!(bound.port, 0);
        assert_eq!(bound.address, addr.address);
    }
}
