//! Per-host HTTP client pool with lifetime and leak management.
//!
//! Each upstream host gets its own pool of reqwest clients. Clients carry
//! creation and last-use metadata; acquisition skips stale idle entries,
//! release recycles anything expired or marked unhealthy, and a background
//! sweep reclaims expired idle clients and force-closes loans that were
//! never returned.
//!
//! Clients are built without an overall request timeout: full-stream
//! responses may legitimately run for minutes. The response-header timeout
//! is carried on the loaned handle and enforced by the caller around the
//! send future.

use dashmap::DashMap;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::error::UpstreamError;

/// Pool key for a URL: host plus effective port.
pub fn host_key(url: &reqwest::Url) -> String {
    let host = url.host_str().unwrap_or("invalid-host");
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Tunables for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneously loaned clients per host.
    pub max_conns_per_host: usize,
    /// Maximum idle clients retained per host.
    pub max_idle_per_host: usize,
    /// Lifetime after which a client is recycled instead of reused.
    pub max_lifetime: Duration,
    /// A loan older than this is considered leaked by the sweep.
    pub leak_after: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// Connection establishment timeout (TCP + TLS).
    pub connect_timeout: Duration,
    /// TCP keep-alive interval.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 64,
            max_idle_per_host: 16,
            max_lifetime: Duration::from_secs(30 * 60),
            leak_after: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A client on loan from the pool.
///
/// Hand it back with [`ConnectionPool::release`]; call
/// [`PooledClient::mark_unhealthy`] first if the attempt failed at the
/// transport level so the client is recycled instead of reused.
pub struct PooledClient {
    id: u64,
    host: String,
    client: Client,
    header_timeout: Duration,
    healthy: bool,
}

impl PooledClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The response-header timeout requested at acquisition.
    pub fn header_timeout(&self) -> Duration {
        self.header_timeout
    }

    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }
}

struct IdleConn {
    id: u64,
    client: Client,
    created_at: Instant,
    #[allow(dead_code)]
    last_used_at: Instant,
    use_count: u64,
}

struct LoanMeta {
    created_at: Instant,
    loaned_at: Instant,
    use_count: u64,
}

#[derive(Default)]
struct HostState {
    idle: VecDeque<IdleConn>,
    in_use: HashMap<u64, LoanMeta>,
}

struct HostPool {
    state: Mutex<HostState>,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hosts: usize,
    pub active: usize,
    pub idle: usize,
    pub leaked: u64,
    pub recycled: u64,
    pub uptime: Duration,
}

/// Process-wide pool of per-host HTTP clients.
pub struct ConnectionPool {
    config: PoolConfig,
    hosts: DashMap<String, Arc<HostPool>>,
    started: Instant,
    next_id: AtomicU64,
    leaked: AtomicU64,
    recycled: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
            started: Instant::now(),
            next_id: AtomicU64::new(1),
            leaked: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    /// Acquire a client for `host`.
    ///
    /// Stale idle clients found at the head of the queue are recycled and
    /// skipped. Fails with [`UpstreamError::ConnectionLimitReached`] when
    /// the host already has `max_conns_per_host` clients on loan.
    pub fn get(&self, host: &str, header_timeout: Duration) -> Result<PooledClient, UpstreamError> {
        let pool = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostPool {
                    state: Mutex::new(HostState::default()),
                })
            })
            .clone();
        let mut state = pool.state.lock().expect("host pool lock poisoned");

        while let Some(conn) = state.idle.pop_front() {
            if conn.created_at.elapsed() >= self.config.max_lifetime {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            state.in_use.insert(
                conn.id,
                LoanMeta {
                    created_at: conn.created_at,
                    loaned_at: Instant::now(),
                    use_count: conn.use_count + 1,
                },
            );
            return Ok(PooledClient {
                id: conn.id,
                host: host.to_string(),
                client: conn.client,
                header_timeout,
                healthy: true,
            });
        }

        if state.in_use.len() >= self.config.max_conns_per_host {
            return Err(UpstreamError::ConnectionLimitReached {
                host: host.to_string(),
            });
        }

        let client = self.build_client()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.in_use.insert(
            id,
            LoanMeta {
                created_at: Instant::now(),
                loaned_at: Instant::now(),
                use_count: 1,
            },
        );
        Ok(PooledClient {
            id,
            host: host.to_string(),
            client,
            header_timeout,
            healthy: true,
        })
    }

    fn build_client(&self) -> Result<Client, UpstreamError> {
        Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .tcp_keepalive(self.config.keep_alive)
            .build()
            .map_err(|e| UpstreamError::transport(format!("failed to build HTTP client: {e}")))
    }

    /// Return a loaned client.
    ///
    /// Recycles it if it was marked unhealthy, exceeded its lifetime, or
    /// the idle queue is full; otherwise it goes back for reuse.
    pub fn release(&self, conn: PooledClient) {
        let Some(pool) = self.hosts.get(&conn.host).map(|p| Arc::clone(p.value())) else {
            return;
        };
        let mut state = pool.state.lock().expect("host pool lock poisoned");

        let Some(meta) = state.in_use.remove(&conn.id) else {
            // The sweep already declared this loan leaked; nothing to do.
            return;
        };

        let expired = meta.created_at.elapsed() >= self.config.max_lifetime;
        if !conn.healthy || expired || state.idle.len() >= self.config.max_idle_per_host {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        state.idle.push_back(IdleConn {
            id: conn.id,
            client: conn.client,
            created_at: meta.created_at,
            last_used_at: Instant::now(),
            use_count: meta.use_count,
        });
    }

    /// One sweep pass: recycle expired idle clients, force-close leaked
    /// loans. Returns `(leaked, recycled)` for this pass.
    pub fn sweep(&self) -> (u64, u64) {
        let mut leaked = 0u64;
        let mut recycled = 0u64;
        for entry in self.hosts.iter() {
            let mut state = entry.value().state.lock().expect("host pool lock poisoned");

            let before = state.idle.len();
            let max_lifetime = self.config.max_lifetime;
            state
                .idle
                .retain(|conn| conn.created_at.elapsed() < max_lifetime);
            recycled += (before - state.idle.len()) as u64;

            let leak_after = self.config.leak_after;
            let stale: Vec<u64> = state
                .in_use
                .iter()
                .filter(|(_, meta)| meta.loaned_at.elapsed() >= leak_after)
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                state.in_use.remove(&id);
                leaked += 1;
            }
        }

        self.leaked.fetch_add(leaked, Ordering::Relaxed);
        self.recycled.fetch_add(recycled, Ordering::Relaxed);
        if leaked > 0 || recycled > 0 {
            tracing::warn!(leaked, recycled, "connection pool sweep reclaimed clients");
        }
        (leaked, recycled)
    }

    /// Run the sweep on its interval until the stop signal fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    result = stop.changed() => {
                        if result.is_err() || *stop.borrow() {
                            tracing::debug!("connection pool sweeper stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let mut active = 0;
        let mut idle = 0;
        for entry in self.hosts.iter() {
            let state = entry.value().state.lock().expect("host pool lock poisoned");
            active += state.in_use.len();
            idle += state.idle.len();
        }
        PoolStats {
            hosts: self.hosts.len(),
            active,
            idle,
            leaked: self.leaked.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}
