//! Acceptor: socket listen yang mengubah readiness menjadi connection baru

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{error, info, trace, warn};

use super::address::NetAddress;
use super::socket::{self as sock, LISTEN_BACKLOG};
use crate::error::fatal;
use crate::reactor::{Channel, EventLoop};

/// Dipanggil dengan socket hasil accept (sudah non-blocking) dan alamat peer
pub type NewConnectionCallback = Arc<dyn Fn(Socket, NetAddress) + Send + Sync>;

const IDLE_PATH: &str = "/dev/null";

pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Arc<Socket>,
    channel: Arc<Channel>,
    listen_addr: NetAddress,
    listening: AtomicBool,
    /// fd cadangan untuk menolak connection saat EMFILE
    idle_fd: Mutex<Option<File>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Bind socket listen. `listen` baru dipanggil lewat `listen()`.
    pub fn new(event_loop: &Arc<EventLoop>, addr: &NetAddress, reuse_port: bool) -> io::Result<Arc<Self>> {
        let socket = sock::bind_listener(addr, reuse_port)?;
        let listen_addr = sock::local_address(&socket).unwrap_or_else(|| addr.clone());
        let idle = File::open(IDLE_PATH)?;
        let fd = socket.as_raw_fd();

        Ok(Arc::new_cyclic(|me: &Weak<Acceptor>| {
            let channel = Channel::new(event_loop, fd);
            let me = me.clone();
            channel.set_read_callback(move || {
                if let Some(acceptor) = me.upgrade() {
                    acceptor.handle_read();
                }
            });
            Acceptor {
                event_loop: Arc::clone(event_loop),
                socket: Arc::new(socket),
                channel,
                listen_addr,
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(Some(idle)),
                new_connection_callback: Mutex::new(None),
            }
        }))
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket, NetAddress) + Send + Sync + 'static,
    {
        *self.new_connection_callback.lock() = Some(Arc::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Alamat yang benar-benar di-bind (port 0 sudah terisi)
    pub fn listen_address(&self) -> &NetAddress {
        &self.listen_addr
    }

    pub fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen(LISTEN_BACKLOG) {
            fatal("listen failed", &e);
        }
        self.channel.enable_reading();
        info!(addr = %self.listen_addr, "listening");
    }

    /// Accept sampai backlog habis (readiness edge-triggered)
    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((conn, peer)) => {
                    if let Err(e) = conn.set_nonblocking(true) {
                        error!(error = %e, "set_nonblocking on accepted socket failed");
                        continue;
                    }
                    let peer = NetAddress::from_sock_addr(&peer)
                        .unwrap_or_else(|| NetAddress::Unix(Default::default()));
                    trace!(fd = conn.as_raw_fd(), %peer, "accepted");
                    let cb = self.new_connection_callback.lock().clone();
                    match cb {
                        Some(cb) => cb(conn, peer),
                        None => drop(conn),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match e.raw_os_error() {
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        warn!(error = %e, "descriptor table exhausted, rejecting pending connection");
                        if !self.reject_with_idle_fd() {
                            break;
                        }
                    }
                    Some(libc::ECONNABORTED) | Some(libc::EPROTO) | Some(libc::EPERM) => {
                        warn!(error = %e, "transient accept error");
                    }
                    _ => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                },
            }
        }
    }

    /// Lepas fd cadangan, accept lalu tutup, buka lagi fd cadangan.
    fn reject_with_idle_fd(&self) -> bool {
        let mut idle = self.idle_fd.lock();
        if idle.take().is_none() {
            return false;
        }
        let rejected = match self.socket.accept() {
            Ok((conn, _)) => {
                drop(conn);
                true
            }
            Err(_) => false,
        };
        *idle = File::open(IDLE_PATH).ok();
        rejected
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.event_loop.is_in_loop_thread() {
            self.channel.disable_all();
            self.channel.remove();
        } else {
            // fd baru ditutup setelah channel lepas dari poller
            let channel = Arc::clone(&self.channel);
            let socket = Arc::clone(&self.socket);
            self.event_loop.queue_in_loop(move || {
                channel.disable_all();
                channel.remove();
                drop(socket);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::reactor::EventLoopThread;

    #[test]
    fn test_accepts_burst_of_connections() {
        let mut thread = EventLoopThread::new("acceptor-test");
        let lp = thread.start().unwrap();
        let (tx, rx) = mpsc::channel();

        let (atx, arx) = mpsc::channel();
        let lp2 = Arc::clone(&lp);
        lp.run_in_loop(move || {
            let acceptor = Acceptor::new(&lp2, &"127.0.0.1:0".parse().unwrap(), false).unwrap();
            let tx = Mutex::new(tx);
            acceptor.set_new_connection_callback(move |_sock, peer| {
                let _ = tx.lock().send(peer);
            });
            acceptor.listen();
            atx.send(acceptor).unwrap();
        });
        let acceptor = arx.recv_timeout(Duration::from_secs(5)).unwrap();
        let port = acceptor.listen_address().port().unwrap();
        assert!(acceptor.listening());

        let clients: Vec<_> = (0..5)
            .map(|_| TcpStream::connect(("127.0.0.1", port)).unwrap())
            .collect();
        for _ in 0..clients.len() {
            let peer = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert!(!peer.is_unix());
        }

        drop(acceptor);
        thread.stop();
    }

    #[test]
    fn test_idle_fd_rejects_pending_connection() {
        let lp = EventLoop::new().unwrap();
        let acceptor = Acceptor::new(&lp, &"127.0.0.1:0".parse().unwrap(), false).unwrap();
        acceptor.listen();
        let port = acceptor.listen_address().port().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        assert!(acceptor.reject_with_idle_fd());
        assert!(acceptor.idle_fd.lock().is_some());
        let mut byte = [0u8; 1];
        assert_eq!(client.read(&mut byte).unwrap(), 0);

        // backlog kosong: tidak ada yang ditolak, fd cadangan tetap dibuka lagi
        assert!(!acceptor.reject_with_idle_fd());
        assert!(acceptor.idle_fd.lock().is_some());
    }
}
