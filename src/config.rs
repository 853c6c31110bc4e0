//! Konfigurasi runtime
//!
//! Semua struct punya `Default` dengan nilai yang aman untuk production;
//! binary tinggal override field yang diperlukan.

use std::time::Duration;

/// Konfigurasi satu `EventLoop`
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Batas waktu satu panggilan poll
    pub poll_timeout: Duration,
    /// Kapasitas awal event batch; digandakan saat batch penuh
    pub initial_events: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            initial_events: 16,
        }
    }
}

/// Konfigurasi `TimerScheduler`
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(1),
            thread_name: "loomnet-timer".to_string(),
        }
    }
}

/// Backoff reconnect untuk `Connector`
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Opsi per-connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Output buffer threshold untuk high-water-mark callback
    pub high_water_mark: usize,
    /// Disable Nagle (hanya TCP)
    pub tcp_nodelay: bool,
    /// SO_KEEPALIVE (hanya TCP)
    pub keepalive: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            high_water_mark: 64 * 1024 * 1024, // 64MB
            tcp_nodelay: false,
            keepalive: true,
        }
    }
}

/// Konfigurasi `Server`
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Prefix nama connection: `{name}-{ip:port}#{n}`
    pub name: String,
    pub reuse_port: bool,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            reuse_port: false,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Konfigurasi `Client`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    /// Reconnect otomatis setelah connection tertutup
    pub retry: bool,
    pub connector: ConnectorConfig,
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "client".to_string(),
            retry: false,
            connector: ConnectorConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}
