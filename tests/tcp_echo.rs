//! Server/Client di atas TCP loopback dan Unix-domain socket

mod common;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use loomnet::{
    Client, ClientConfig, ConnectorConfig, EventLoopThread, NetAddress, SchedulerConfig, Server,
    ServerConfig, TimerScheduler,
};

use common::{init_tracing, sync, wait_until, TIMEOUT};

fn echo_server(thread: &mut EventLoopThread, sched: &TimerScheduler, addr: &NetAddress, name: &str) -> Server {
    let lp = thread.start().unwrap();
    let config = ServerConfig {
        name: name.to_string(),
        ..ServerConfig::default()
    };
    let server = Server::new(&lp, sched, addr, config).unwrap();
    server.set_message_callback(|conn, buf| {
        let data = buf.retrieve_all_as_vec();
        conn.send(&data);
    });
    server
}

#[test]
fn test_tcp_echo_round_trip() {
    init_tracing();
    let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
    let mut thread = EventLoopThread::new("tcp-echo");
    let server = echo_server(&mut thread, &sched, &"127.0.0.1:0".parse().unwrap(), "echo");
    server.start();
    assert!(wait_until(|| server.listening()));
    let port = server.listen_address().port().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"ping over loomnet").unwrap();
    let mut got = [0u8; 17];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"ping over loomnet");

    // payload besar melewati beberapa read event
    let big: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let writer = {
        let mut w = stream.try_clone().unwrap();
        let big = big.clone();
        std::thread::spawn(move || w.write_all(&big).unwrap())
    };
    let mut echoed = vec![0u8; big.len()];
    stream.read_exact(&mut echoed).unwrap();
    writer.join().unwrap();
    assert_eq!(echoed, big);

    assert!(wait_until(|| server.connection_count() == 1));
    drop(stream);
    assert!(wait_until(|| server.connection_count() == 0));

    let lp = thread.event_loop().cloned().unwrap();
    drop(server);
    sync(&lp);
    thread.stop();
    sched.stop();
}

#[test]
fn test_unix_domain_echo() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
    let mut thread = EventLoopThread::new("unix-echo");
    let server = echo_server(&mut thread, &sched, &NetAddress::unix(&path), "unix-echo");
    server.start();
    assert!(wait_until(|| server.listening()));
    assert_eq!(server.listen_address(), &NetAddress::unix(&path));

    let mut stream = UnixStream::connect(&path).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(b"over a unix socket").unwrap();
    let mut got = [0u8; 18];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"over a unix socket");

    drop(stream);
    assert!(wait_until(|| server.connection_count() == 0));
    let lp = thread.event_loop().cloned().unwrap();
    drop(server);
    sync(&lp);
    thread.stop();
    sched.stop();
}

#[test]
fn test_connection_names_and_callbacks() {
    init_tracing();
    let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
    let mut thread = EventLoopThread::new("naming");
    let lp = thread.start().unwrap();
    let config = ServerConfig {
        name: "naming".to_string(),
        ..ServerConfig::default()
    };
    let server = Server::new(&lp, &sched, &"127.0.0.1:0".parse().unwrap(), config).unwrap();
    let (tx, rx) = mpsc::channel();
    server.set_connection_callback(move |conn| {
        tx.send((conn.name().to_string(), conn.connected())).unwrap();
    });
    server.start();
    assert!(wait_until(|| server.listening()));
    let port = server.listen_address().port().unwrap();
    let prefix = format!("naming-127.0.0.1:{port}#");

    let first = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (format!("{prefix}1"), true));
    let second = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (format!("{prefix}2"), true));
    assert_eq!(server.connection_count(), 2);

    drop(first);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (format!("{prefix}1"), false));
    drop(second);
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (format!("{prefix}2"), false));
    assert!(wait_until(|| server.connection_count() == 0));

    drop(server);
    sync(&lp);
    thread.stop();
    sched.stop();
}

#[test]
fn test_client_server_exchange_and_disconnect() {
    init_tracing();
    let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();
    let mut server_thread = EventLoopThread::new("exchange-server");
    let server = echo_server(&mut server_thread, &sched, &"127.0.0.1:0".parse().unwrap(), "exchange");
    server.start();
    assert!(wait_until(|| server.listening()));

    let mut client_thread = EventLoopThread::new("exchange-client");
    let client_loop = client_thread.start().unwrap();
    let client = Client::new(
        &client_loop,
        &sched,
        server.listen_address().clone(),
        ClientConfig::default(),
    );
    let (up_tx, up_rx) = mpsc::channel();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(b"hello server");
        }
        up_tx.send(conn.connected()).unwrap();
    });
    let (msg_tx, msg_rx) = mpsc::channel();
    client.set_message_callback(move |_conn, buf| {
        msg_tx.send(buf.retrieve_all_as_vec()).unwrap();
    });
    client.connect();

    assert!(up_rx.recv_timeout(TIMEOUT).unwrap());
    let mut echoed = Vec::new();
    while echoed.len() < 12 {
        echoed.extend(msg_rx.recv_timeout(TIMEOUT).unwrap());
    }
    assert_eq!(echoed, b"hello server");
    let conn = client.connection().unwrap();
    assert!(conn.name().starts_with("client:127.0.0.1:"));
    drop(conn);

    // half-close: server melihat EOF, menutup, client melihat DOWN
    client.disconnect();
    assert!(!up_rx.recv_timeout(TIMEOUT).unwrap());
    assert!(wait_until(|| client.connection().is_none()));
    assert!(wait_until(|| server.connection_count() == 0));

    drop(client);
    sync(&client_loop);
    client_thread.stop();
    drop(server);
    server_thread.stop();
    sched.stop();
}

#[test]
fn test_client_retries_until_server_appears() {
    init_tracing();
    // port yang dijamin kosong saat client mulai connect
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let addr: NetAddress = format!("127.0.0.1:{port}").parse().unwrap();
    let sched = TimerScheduler::start(SchedulerConfig::default()).unwrap();

    let mut client_thread = EventLoopThread::new("retry-client");
    let client_loop = client_thread.start().unwrap();
    let config = ClientConfig {
        name: "retry".to_string(),
        retry: true,
        connector: ConnectorConfig {
            initial_retry_delay: Duration::from_millis(20),
            max_retry_delay: Duration::from_millis(100),
        },
        ..ClientConfig::default()
    };
    let client = Client::new(&client_loop, &sched, addr.clone(), config);
    assert!(client.retry());
    let ups = Arc::new(AtomicUsize::new(0));
    let u = Arc::clone(&ups);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            u.fetch_add(1, Ordering::SeqCst);
        }
    });
    client.connect();
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(ups.load(Ordering::SeqCst), 0);

    let mut server_thread = EventLoopThread::new("retry-server");
    let server = echo_server(&mut server_thread, &sched, &addr, "late");
    server.start();
    assert!(wait_until(|| server.listening()));
    assert!(wait_until(|| ups.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| server.connection_count() == 1));

    // server menutup connection: client reconnect karena retry aktif
    for conn in server.connections() {
        conn.force_close();
    }
    assert!(wait_until(|| ups.load(Ordering::SeqCst) == 2));
    assert!(wait_until(|| client.connection().is_some_and(|c| c.connected())));

    client.stop();
    client.disconnect();
    assert!(wait_until(|| client.connection().is_none()));
    drop(client);
    sync(&client_loop);
    client_thread.stop();
    drop(server);
    server_thread.stop();
    sched.stop();
}
