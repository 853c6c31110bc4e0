//! Alamat endpoint: IPv4, IPv6, atau Unix domain socket dalam satu tipe

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use socket2::{Domain, SockAddr};

use crate::error::Error;

/// Tagged address untuk semua transport stream yang didukung
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetAddress {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    /// Path Unix domain socket (kosong untuk socket tanpa nama)
    Unix(PathBuf),
}

impl NetAddress {
    /// Alamat listen di semua interface (atau loopback saja)
    pub fn from_port(port: u16, loopback_only: bool, ipv6: bool) -> Self {
        match (ipv6, loopback_only) {
            (false, false) => NetAddress::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            (false, true) => NetAddress::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            (true, false) => NetAddress::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
            (true, true) => NetAddress::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)),
        }
    }

    pub fn unix(path: impl AsRef<Path>) -> Self {
        NetAddress::Unix(path.as_ref().to_path_buf())
    }

    /// Resolve hostname, ambil hasil pertama
    pub fn resolve(host: &str, port: u16) -> Result<Self, Error> {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(format!("{host}:{port}: {e}")))?
            .next()
            .map(NetAddress::from)
            .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}: no address")))
    }

    pub fn domain(&self) -> Domain {
        match self {
            NetAddress::V4(_) => Domain::IPV4,
            NetAddress::V6(_) => Domain::IPV6,
            NetAddress::Unix(_) => Domain::UNIX,
        }
    }

    #[inline]
    pub fn is_unix(&self) -> bool {
        matches!(self, NetAddress::Unix(_))
    }

    /// Port untuk alamat inet, `None` untuk Unix
    pub fn port(&self) -> Option<u16> {
        match self {
            NetAddress::V4(a) => Some(a.port()),
            NetAddress::V6(a) => Some(a.port()),
            NetAddress::Unix(_) => None,
        }
    }

    pub fn to_sock_addr(&self) -> io::Result<SockAddr> {
        match self {
            NetAddress::V4(a) => Ok(SockAddr::from(*a)),
            NetAddress::V6(a) => Ok(SockAddr::from(*a)),
            NetAddress::Unix(path) => SockAddr::unix(path),
        }
    }

    /// Konversi dari alamat kernel. Unix tanpa nama menjadi path kosong.
    pub fn from_sock_addr(addr: &SockAddr) -> Option<Self> {
        if let Some(inet) = addr.as_socket() {
            return Some(NetAddress::from(inet));
        }
        if addr.family() == libc::AF_UNIX as libc::sa_family_t {
            let path = addr.as_pathname().map(Path::to_path_buf).unwrap_or_default();
            return Some(NetAddress::Unix(path));
        }
        None
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => NetAddress::V4(a),
            SocketAddr::V6(a) => NetAddress::V6(a),
        }
    }
}

impl FromStr for NetAddress {
    type Err = Error;

    /// `ip:port`, `[ipv6]:port`, `unix:/path`, atau path absolut
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidAddress(s.to_string()));
            }
            return Ok(NetAddress::unix(path));
        }
        if s.starts_with('/') {
            return Ok(NetAddress::unix(s));
        }
        s.parse::<SocketAddr>()
            .map(NetAddress::from)
            .map_err(|e| Error::InvalidAddress(format!("{s}: {e}")))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::V4(a) => write!(f, "{a}"),
            NetAddress::V6(a) => write!(f, "{a}"),
            NetAddress::Unix(path) if path.as_os_str().is_empty() => f.write_str("unix:<unnamed>"),
            NetAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}
