//! Open connections kept for reuse.
//!
//! Each delivery worker owns one cache; connections are never shared
//! between workers. A connection is taken out of the cache for the length
//! of a transaction and put back afterwards, so at most one attempt is in
//! flight on it and at most one connection exists per host and mailer.

use core::fmt;
use std::time::Duration;

use ahash::AHashMap;
use serde::Serialize;
use tern_common::{Reply, config::SecurityLevel};
use tern_security::DaneState;
use tern_smtp::client::SmtpClient;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::Instant,
};
use tracing::{debug, trace};

use crate::config::CacheConfig;

/// Where a connection stands in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// TCP is up, no greeting read yet
    Connected,
    /// `EHLO`/`LHLO` done, security layers negotiated; ready for `MAIL`
    Ready,
    /// Inside a mail transaction
    Transaction,
    /// The channel is gone or must not be used again
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Transaction => "transaction",
            Self::Closed => "closed",
        })
    }
}

/// Per-destination connection state.
pub struct ConnectionContext<S = TcpStream> {
    pub client: SmtpClient<S>,
    pub host: String,
    pub mailer: String,
    pub phase: Phase,
    /// DANE state of `host` when the connection was opened
    pub dane: DaneState,
    /// Last reply that ended a command
    pub last_reply: Option<Reply>,
    opened: Instant,
    last_used: Instant,
    deliveries: usize,
}

impl<S> fmt::Debug for ConnectionContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("host", &self.host)
            .field("mailer", &self.mailer)
            .field("phase", &self.phase)
            .field("deliveries", &self.deliveries)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ConnectionContext<S> {
    pub fn new(client: SmtpClient<S>, host: impl Into<String>, mailer: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            client,
            host: host.into(),
            mailer: mailer.into(),
            phase: Phase::Connected,
            dane: DaneState::NotRequested,
            last_reply: None,
            opened: now,
            last_used: now,
            deliveries: 0,
        }
    }

    pub const fn deliveries(&self) -> usize {
        self.deliveries
    }

    /// Counts a finished transaction
    pub fn record_delivery(&mut self) {
        self.deliveries += 1;
        self.last_used = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    pub fn security(&self) -> SecurityLevel {
        self.client.security().level()
    }

    /// Whether the connection can start another transaction for a
    /// recipient that needs at least `required`
    pub fn is_reusable(&self, required: SecurityLevel) -> bool {
        self.client.is_open() && self.phase == Phase::Ready && self.client.security().satisfies(required)
    }

    /// Says goodbye unless the channel is already gone
    pub async fn close(&mut self) {
        if self.client.is_open() {
            self.client.quit().await;
        }
        self.phase = Phase::Closed;
    }
}

/// One row of [`ConnectionCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedConnection {
    pub host: String,
    pub mailer: String,
    pub phase: Phase,
    pub security: SecurityLevel,
    pub idle: Duration,
    pub deliveries: usize,
}

type Key = (String, String);

fn key(host: &str, mailer: &str) -> Key {
    (host.to_ascii_lowercase(), mailer.to_string())
}

pub struct ConnectionCache<S = TcpStream> {
    entries: AHashMap<Key, ConnectionContext<S>>,
    config: CacheConfig,
    idle_timeout: Duration,
}

impl<S> fmt::Debug for ConnectionCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("open", &self.entries.len())
            .field("config", &self.config)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> ConnectionCache<S> {
    pub fn new(config: CacheConfig, idle_timeout: Duration) -> Self {
        Self {
            entries: AHashMap::new(),
            config,
            idle_timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an open connection to `host` through `mailer` is cached
    pub fn contains(&self, host: &str, mailer: &str) -> bool {
        self.entries
            .get(&key(host, mailer))
            .is_some_and(|context| context.client.is_open())
    }

    /// Takes the cached connection to `host`, if it may be reused for a
    /// recipient requiring `required`.
    ///
    /// A connection that idled too long or falls short of `required` is
    /// closed, and the caller has to open a fresh one.
    pub async fn take(
        &mut self,
        host: &str,
        mailer: &str,
        required: SecurityLevel,
    ) -> Option<ConnectionContext<S>> {
        let mut context = self.entries.remove(&key(host, mailer))?;

        if context.idle() >= self.idle_timeout {
            debug!(host, mailer, idle = ?context.idle(), "Cached connection expired");
            context.close().await;
            return None;
        }

        if !context.is_reusable(required) {
            debug!(
                host,
                mailer,
                have = ?context.security(),
                need = ?required,
                "Cached connection not reusable"
            );
            context.close().await;
            return None;
        }

        trace!(host, mailer, deliveries = context.deliveries, "Reusing connection");
        Some(context)
    }

    /// Returns a connection after a transaction.
    ///
    /// Closed connections and connections that reached their delivery
    /// limit are shut down instead. When the cache is full the connection
    /// idle for longest makes room.
    pub async fn put(&mut self, mut context: ConnectionContext<S>) {
        if !context.client.is_open() || context.phase != Phase::Ready {
            context.close().await;
            return;
        }

        if context.deliveries >= self.config.max_deliveries || self.config.max_connections == 0 {
            trace!(host = %context.host, "Retiring connection");
            context.close().await;
            return;
        }

        let key = key(&context.host, &context.mailer);
        if let Some(mut previous) = self.entries.remove(&key) {
            previous.close().await;
        }

        while self.entries.len() >= self.config.max_connections {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, context)| context.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            if let Some(mut evicted) = self.entries.remove(&oldest) {
                debug!(host = %evicted.host, "Evicting cached connection");
                evicted.close().await;
            }
        }

        self.entries.insert(key, context);
    }

    /// Closes every connection that idled past the timeout
    pub async fn expire(&mut self) -> usize {
        let expired = self
            .entries
            .iter()
            .filter(|(_, context)| context.idle() >= self.idle_timeout || !context.client.is_open())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for key in &expired {
            if let Some(mut context) = self.entries.remove(key) {
                context.close().await;
            }
        }

        expired.len()
    }

    /// Closes every cached connection with `QUIT`
    pub async fn flush(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut context) in self.entries.drain() {
            context.close().await;
        }
        count
    }

    pub fn snapshot(&self) -> Vec<CachedConnection> {
        let mut rows = self
            .entries
            .values()
            .map(|context| CachedConnection {
                host: context.host.clone(),
                mailer: context.mailer.clone(),
                phase: context.phase,
                security: context.security(),
                idle: context.idle(),
                deliveries: context.deliveries,
            })
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| (&a.host, &a.mailer).cmp(&(&b.host, &b.mailer)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_common::config::ClientTimeouts;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

    use super::*;

    /// A peer that answers every command with `250`, and `QUIT` with `221`
    fn peer() -> (DuplexStream, tokio::task::JoinHandle<Vec<String>>) {
        let (client, server) = duplex(4096);
        let handle = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let quit = line.eq_ignore_ascii_case("QUIT");
                seen.push(line);
                let reply: &[u8] = if quit { b"221 2.0.0 Bye\r\n" } else { b"250 OK\r\n" };
                if write.write_all(reply).await.is_err() || quit {
                    break;
                }
            }
            seen
        });
        (client, handle)
    }

    fn context(host: &str) -> (ConnectionContext<DuplexStream>, tokio::task::JoinHandle<Vec<String>>) {
        let (stream, handle) = peer();
        let client = SmtpClient::new(stream, host, ClientTimeouts::default());
        let mut context = ConnectionContext::new(client, host, "esmtp");
        context.phase = Phase::Ready;
        (context, handle)
    }

    fn cache(max_connections: usize) -> ConnectionCache<DuplexStream> {
        ConnectionCache::new(
            CacheConfig {
                max_connections,
                max_deliveries: 3,
            },
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn reuse_matching_connection() {
        let mut cache = cache(4);
        let (context, _peer) = context("mx.example.com");
        cache.put(context).await;

        assert!(cache.contains("MX.example.com", "esmtp"));
        assert!(!cache.contains("mx.example.com", "relay"));

        let context = cache
            .take("mx.example.com", "esmtp", SecurityLevel::None)
            .await
            .unwrap();
        assert_eq!(context.host, "mx.example.com");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn insufficient_security_forces_a_new_connection() {
        let mut cache = cache(4);
        let (context, peer) = context("mx.example.com");
        cache.put(context).await;

        assert!(
            cache
                .take("mx.example.com", "esmtp", SecurityLevel::Encrypted)
                .await
                .is_none()
        );
        assert!(cache.is_empty());
        assert_eq!(peer.await.unwrap(), vec!["QUIT".to_string()]);
    }

    #[tokio::test]
    async fn one_connection_per_host_and_mailer() {
        let mut cache = cache(4);
        let (first, first_peer) = context("mx.example.com");
        let (second, _second_peer) = context("mx.example.com");

        cache.put(first).await;
        cache.put(second).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(first_peer.await.unwrap(), vec!["QUIT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn least_recently_used_is_evicted() {
        let mut cache = cache(2);
        let (a, a_peer) = context("a.test");
        cache.put(a).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let (b, _b_peer) = context("b.test");
        cache.put(b).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        let (c, _c_peer) = context("c.test");
        cache.put(c).await;

        let hosts = cache
            .snapshot()
            .into_iter()
            .map(|row| row.host)
            .collect::<Vec<_>>();
        assert_eq!(hosts, vec!["b.test", "c.test"]);
        assert_eq!(a_peer.await.unwrap(), vec!["QUIT".to_string()]);
    }

    #[tokio::test]
    async fn worn_out_connections_are_retired() {
        let mut cache = cache(4);
        let (mut context, peer) = context("mx.example.com");
        for _ in 0..3 {
            context.record_delivery();
        }
        cache.put(context).await;

        assert!(cache.is_empty());
        assert_eq!(peer.await.unwrap(), vec!["QUIT".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_expire() {
        let mut cache = cache(4);
        let (a, _a_peer) = context("a.test");
        cache.put(a).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        let (b, _b_peer) = context("b.test");
        cache.put(b).await;
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(cache.expire().await, 1);
        assert!(cache.contains("b.test", "esmtp"));
        assert!(cache.take("b.test", "esmtp", SecurityLevel::None).await.is_some());
    }

    #[tokio::test]
    async fn flush_and_snapshot() {
        let mut cache = cache(4);
        let (a, a_peer) = context("a.test");
        let (b, b_peer) = context("b.test");
        cache.put(a).await;
        cache.put(b).await;

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].phase, Phase::Ready);
        assert_eq!(snapshot[0].security, SecurityLevel::None);

        assert_eq!(cache.flush().await, 2);
        assert!(cache.is_empty());
        assert_eq!(a_peer.await.unwrap(), vec!["QUIT".to_string()]);
        assert_eq!(b_peer.await.unwrap(), vec!["QUIT".to_string()]);
    }
}
