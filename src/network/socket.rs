//! Helper socket2 untuk komponen network

use std::fs;
use std::io;
use std::net::Shutdown;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use super::address::NetAddress;

/// Backlog `listen`
pub(crate) const LISTEN_BACKLOG: i32 = libc::SOMAXCONN;

/// Stream socket non-blocking (CLOEXEC diset socket2)
pub(crate) fn new_stream(domain: Domain) -> io::Result<Socket> {
    let protocol = if domain == Domain::UNIX {
        None
    } else {
        Some(Protocol::TCP)
    };
    let socket = Socket::new(domain, Type::STREAM, protocol)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Socket listen yang sudah di-bind, belum `listen`.
///
/// Path Unix yang tertinggal dari proses sebelumnya dihapus dulu.
pub(crate) fn bind_listener(addr: &NetAddress, reuse_port: bool) -> io::Result<Socket> {
    let socket = new_stream(addr.domain())?;
    match addr {
        NetAddress::Unix(path) => match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket path"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        },
        _ => {
            socket.set_reuse_address(true)?;
            if reuse_port {
                socket.set_reuse_port(true)?;
            }
        }
    }
    socket.bind(&addr.to_sock_addr()?)?;
    Ok(socket)
}

pub(crate) fn local_address(socket: &Socket) -> Option<NetAddress> {
    socket
        .local_addr()
        .ok()
        .and_then(|a| NetAddress::from_sock_addr(&a))
}

pub(crate) fn peer_address(socket: &Socket) -> Option<NetAddress> {
    socket
        .peer_addr()
        .ok()
        .and_then(|a| NetAddress::from_sock_addr(&a))
}

/// SO_ERROR sebagai errno (0 = tidak ada error)
pub(crate) fn pending_error(socket: &Socket) -> i32 {
    match socket.take_error() {
        Ok(None) => 0,
        Ok(Some(e)) | Err(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

/// Connect ke diri sendiri: bisa terjadi sesaat dengan ephemeral port
/// saat connect ke port lokal yang tidak di-listen.
pub(crate) fn is_self_connect(socket: &Socket) -> bool {
    let (Ok(local), Ok(peer)) = (socket.local_addr(), socket.peer_addr()) else {
        return false;
    };
    match (local.as_socket(), peer.as_socket()) {
        (Some(l), Some(p)) => l == p,
        _ => false,
    }
}

/// Half-close arah tulis
pub(crate) fn shutdown_write(socket: &Socket) {
    if let Err(e) = socket.shutdown(Shutdown::Write) {
        error!(error = %e, "shutdown write failed");
    }
}

/// Pesan errno untuk log
pub(crate) fn errno_message(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_bind_listener_ephemeral_port() {
        let addr: NetAddress = "127.0.0.1:0".parse().unwrap();
        let socket = bind_listener(&addr, false).unwrap();
        let local = local_address(&socket).unwrap();
        assert_ne!(local.port(), Some(0));
        assert!(socket.nonblocking().unwrap());
    }

    #[test]
    fn test_bind_listener_replaces_stale_unix_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"").unwrap();
        let addr = NetAddress::unix(&path);
        let socket = bind_listener(&addr, false).unwrap();
        assert_eq!(local_address(&socket), Some(addr));
    }

    #[test]
    fn test_pending_error_and_self_connect_on_pair() {
        let (a, _b) = UnixStream::pair().unwrap();
        let socket = Socket::from(a);
        assert_eq!(pending_error(&socket), 0);
        assert!(!is_self_connect(&socket));
    }
}
