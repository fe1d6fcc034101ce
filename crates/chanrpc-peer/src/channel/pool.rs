use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chanrpc_transport::{MessageSink, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::sync::lock;

/// Default number of physical sockets in a pool.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Socket pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of physical sockets.
    pub size: usize,
    /// How long a key keeps routing to the socket it last used.
    pub affinity_window: Duration,
    /// Most keys remembered at once. The least recently used is evicted.
    pub affinity_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            affinity_window: Duration::from_secs(1),
            affinity_capacity: 32,
        }
    }
}

impl PoolConfig {
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_affinity_window(mut self, window: Duration) -> Self {
        self.affinity_window = window;
        self
    }

    pub fn with_affinity_capacity(mut self, capacity: usize) -> Self {
        self.affinity_capacity = capacity;
        self
    }
}

/// Outbound fan-out over several physical sockets.
///
/// Each send goes to the open socket with the least buffered data, lowest
/// index on ties. A keyed send reuses the socket its key used last if that
/// was within the affinity window.
pub struct SocketPool {
    sockets: Vec<Arc<dyn MessageSink>>,
    config: PoolConfig,
    affinity: Mutex<HashMap<String, (usize, Instant)>>,
}

impl SocketPool {
    pub fn new(sockets: Vec<Arc<dyn MessageSink>>, config: PoolConfig) -> Self {
        Self {
            sockets,
            config,
            affinity: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Index of the socket the next send with `key` would use.
    pub fn select(&self, key: Option<&str>) -> Option<usize> {
        let now = Instant::now();
        let Some(key) = key else {
            return self.least_buffered();
        };

        let mut affinity = lock(&self.affinity);
        if let Some((index, last_used)) = affinity.get_mut(key) {
            let socket_open = !self.sockets[*index].is_closed();
            if socket_open && now.duration_since(*last_used) <= self.config.affinity_window {
                *last_used = now;
                return Some(*index);
            }
        }

        let index = self.least_buffered()?;
        if !affinity.contains_key(key) && affinity.len() >= self.config.affinity_capacity {
            let oldest = affinity
                .iter()
                .min_by_key(|(_, (_, last_used))| *last_used)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                trace!(key = %oldest, "evicting socket affinity");
                affinity.remove(&oldest);
            }
        }
        if self.config.affinity_capacity > 0 {
            affinity.insert(key.to_string(), (index, now));
        }
        Some(index)
    }

    fn least_buffered(&self) -> Option<usize> {
        self.sockets
            .iter()
            .enumerate()
            .filter(|(_, socket)| !socket.is_closed())
            .min_by_key(|(index, socket)| (socket.buffered_amount(), *index))
            .map(|(index, _)| index)
    }

    fn send_to(&self, key: Option<&str>, message: Bytes) -> chanrpc_transport::Result<()> {
        let index = self.select(key).ok_or(TransportError::Closed)?;
        trace!(socket = index, len = message.len(), "pool send");
        match key {
            Some(key) => self.sockets[index].send_keyed(key, message),
            None => self.sockets[index].send(message),
        }
    }
}

impl MessageSink for SocketPool {
    fn send(&self, message: Bytes) -> chanrpc_transport::Result<()> {
        self.send_to(None, message)
    }

    fn send_keyed(&self, key: &str, message: Bytes) -> chanrpc_transport::Result<()> {
        self.send_to(Some(key), message)
    }

    fn buffered_amount(&self) -> usize {
        self.sockets.iter().map(|s| s.buffered_amount()).sum()
    }

    fn close(&self) {
        for socket in &self.sockets {
            socket.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.sockets.iter().all(|s| s.is_closed())
    }
}

/// Combine several transports into one pooled transport.
///
/// Inbound messages from every socket are merged; the merged stream ends
/// once every socket has ended. Must be called within a tokio runtime.
pub fn pooled_transport(transports: Vec<Transport>, config: PoolConfig) -> Transport {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut sinks = Vec::with_capacity(transports.len());
    for (index, transport) in transports.into_iter().enumerate() {
        let (sink, mut incoming) = transport.into_parts();
        sinks.push(sink);
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                if tx.send(message).is_err() {
                    break;
                }
            }
            debug!(socket = index, "pooled socket ended");
        });
    }
    Transport::new(Arc::new(SocketPool::new(sinks, config)), rx)
}

/// Connect `config.size` sockets with `connect` and pool them.
pub async fn connect_pool<F, Fut, E>(config: PoolConfig, mut connect: F) -> Result<Transport, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Transport, E>>,
{
    let mut transports = Vec::with_capacity(config.size);
    for index in 0..config.size {
        transports.push(connect(index).await?);
    }
    Ok(pooled_transport(transports, config))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chanrpc_transport::memory_pair;

    use super::*;

    #[derive(Default)]
    struct FakeSink {
        buffered: AtomicUsize,
        closed: AtomicBool,
        sent: Mutex<Vec<Bytes>>,
    }

    impl MessageSink for FakeSink {
        fn send(&self, message: Bytes) -> chanrpc_transport::Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn pool(buffered: &[usize], config: PoolConfig) -> (SocketPool, Vec<Arc<FakeSink>>) {
        let fakes: Vec<Arc<FakeSink>> = buffered
            .iter()
            .map(|&b| {
                let sink = Arc::new(FakeSink::default());
                sink.buffered.store(b, Ordering::SeqCst);
                sink
            })
            .collect();
        let sinks = fakes
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn MessageSink>)
            .collect();
        (SocketPool::new(sinks, config), fakes)
    }

    #[tokio::test]
    async fn least_buffered_socket_wins() {
        let (pool, fakes) = pool(&[5, 1, 3], PoolConfig::default());
        pool.send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(fakes[1].sent.lock().unwrap().len(), 1);

        let (pool, _) = self::pool(&[2, 2, 2], PoolConfig::default());
        assert_eq!(pool.select(None), Some(0));
    }

    #[tokio::test]
    async fn closed_sockets_are_skipped() {
        let (pool, fakes) = pool(&[0, 4], PoolConfig::default());
        fakes[0].close();
        assert_eq!(pool.select(None), Some(1));
        fakes[1].close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.send(Bytes::from_static(b"x")),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_sends_stick_within_the_window() {
        let (pool, fakes) = pool(&[3, 0], PoolConfig::default());
        assert_eq!(pool.select(Some("method")), Some(1));

        fakes[1].buffered.store(10, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pool.select(Some("method")), Some(1));
        assert_eq!(pool.select(Some("other")), Some(0));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(pool.select(Some("method")), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn affinity_evicts_least_recently_used() {
        let config = PoolConfig::default().with_affinity_capacity(2);
        let (pool, _) = pool(&[0, 0], config);
        pool.select(Some("a"));
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.select(Some("b"));
        tokio::time::advance(Duration::from_millis(10)).await;
        pool.select(Some("c"));

        let affinity = pool.affinity.lock().unwrap();
        assert_eq!(affinity.len(), 2);
        assert!(!affinity.contains_key("a"));
    }

    #[tokio::test]
    async fn pooled_transport_merges_inbound() {
        let (a_local, a_remote) = memory_pair();
        let (b_local, b_remote) = memory_pair();
        let mut pooled = pooled_transport(vec![a_local, b_local], PoolConfig::default().with_size(2));

        a_remote.send(Bytes::from_static(b"from a")).unwrap();
        let first = pooled.recv().await.unwrap();
        b_remote.send(Bytes::from_static(b"from b")).unwrap();
        let second = pooled.recv().await.unwrap();
        assert_eq!(first.as_ref(), b"from a");
        assert_eq!(second.as_ref(), b"from b");

        drop(a_remote);
        drop(b_remote);
        assert!(pooled.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_pool_opens_configured_size() {
        let mut remotes = Vec::new();
        let transport = connect_pool(PoolConfig::default().with_size(3), |_| {
            let (local, remote) = memory_pair();
            remotes.push(remote);
            async move { Ok::<_, TransportError>(local) }
        })
        .await
        .unwrap();
        assert_eq!(remotes.len(), 3);
        assert!(!transport.sink().is_closed());
    }
}
