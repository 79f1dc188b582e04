use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use mockroute_lib::dht_messages::{DhtMessage, PeerInfo};
use mockroute_lib::keys::PrivateKey;

use crate::error::HostError;
use crate::host::{Host, InboundReceiver, InboundRequest};

struct ConnectionStats {
    active_count: usize,
    last_cleanup: Instant,
}

struct ConnectionLimiter {
    stats: HashMap<String, ConnectionStats>,
    max_connections_per_host: usize,
    cleanup_interval: Duration,
}

impl ConnectionLimiter {
    fn new(max_connections_per_host: usize) -> Self {
        Self {
            stats: HashMap::new(),
            max_connections_per_host,
            cleanup_interval: Duration::from_secs(30),
        }
    }

    fn try_acquire(&mut self, address: &str) -> bool {
        let now = Instant::now();

        if self
            .stats
            .values()
            .any(|s| now.duration_since(s.last_cleanup) > self.cleanup_interval)
        {
            self.cleanup_old_entries(now);
        }

        let stats = self
            .stats
            .entry(address.to_string())
            .or_insert(ConnectionStats {
                active_count: 0,
                last_cleanup: now,
            });

        if stats.active_count >= self.max_connections_per_host {
            return false;
        }
        stats.active_count += 1;
        true
    }

    fn release(&mut self, address: &str) {
        if let Some(stats) = self.stats.get_mut(address) {
            stats.active_count = stats.active_count.saturating_sub(1);
        }
    }

    fn cleanup_old_entries(&mut self, now: Instant) {
        let keep_for = self.cleanup_interval * 2;
        self.stats.retain(|_, stats| {
            stats.active_count > 0 || now.duration_since(stats.last_cleanup) < keep_for
        });
    }
}

struct ConnectionGuard {
    address: String,
    limiter: Arc<Mutex<ConnectionLimiter>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let limiter = Arc::clone(&self.limiter);
        let address = self.address.clone();
        tokio::spawn(async move {
            limiter.lock().await.release(&address);
        });
    }
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_CONNECTIONS_PER_HOST: usize = 5;

/// A [`Host`] speaking bincode-framed request/response over TCP, one
/// connection per request.
pub struct TcpHost {
    info: PeerInfo,
    limiter: Arc<Mutex<ConnectionLimiter>>,
    incoming: StdMutex<Option<InboundReceiver>>,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TcpHost {
    /// Binds a listener on `address`; the peer ID is derived from `key`.
    ///
    /// The host advertises the address actually bound, so port 0 yields the
    /// port the OS picked.
    pub async fn bind(key: &PrivateKey, address: &str) -> Result<Self, HostError> {
        let listener = TcpListener::bind(address).await?;
        let address = listener.local_addr()?.to_string();
        let info = PeerInfo::new(key.peer_id(), address.clone());
        let (sender, receiver) = mpsc::unbounded_channel();

        debug!("[{}] Listening for peers", address);
        let task = tokio::spawn(accept_loop(listener, sender, address));

        Ok(Self {
            info,
            limiter: Arc::new(Mutex::new(ConnectionLimiter::new(MAX_CONNECTIONS_PER_HOST))),
            incoming: StdMutex::new(Some(receiver)),
            listener_task: StdMutex::new(Some(task)),
        })
    }

    async fn call_with_retry(&self, address: &str, message: DhtMessage) -> Result<DhtMessage, HostError> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_error = HostError::Unreachable(address.to_string());

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!(
                    "Retrying connection to {} (attempt {}/{})",
                    address,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.call_once(address, message.clone()).await {
                Ok(response) => return Ok(response),
                Err(e @ HostError::ConnectionLimit(_)) => return Err(e),
                Err(e) => last_error = e,
            }
        }

        Err(last_error)
    }

    async fn call_once(&self, address: &str, message: DhtMessage) -> Result<DhtMessage, HostError> {
        if !self.limiter.lock().await.try_acquire(address) {
            warn!("Connection limit reached for {}, rejecting request", address);
            return Err(HostError::ConnectionLimit(address.to_string()));
        }
        let _guard = ConnectionGuard {
            address: address.to_string(),
            limiter: Arc::clone(&self.limiter),
        };

        let mut stream = match timeout(DEFAULT_TIMEOUT, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", address, e);
                return Err(e.into());
            }
            Err(_) => return Err(HostError::Timeout(address.to_string())),
        };

        let encoded = bincode::serialize(&message)?;
        match timeout(DEFAULT_TIMEOUT, stream.write_all(&encoded)).await {
            Ok(result) => result?,
            Err(_) => return Err(HostError::Timeout(address.to_string())),
        }

        // Half-close so the peer's read_to_end sees the end of the request.
        if let Ok(Err(e)) = timeout(Duration::from_secs(1), stream.shutdown()).await {
            debug!("Shutdown error (non-critical): {}", e);
        }

        let mut buffer = Vec::new();
        match timeout(DEFAULT_TIMEOUT, stream.read_to_end(&mut buffer)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => return Err(HostError::Timeout(address.to_string())),
        }

        Ok(bincode::deserialize(&buffer)?)
    }
}

async fn accept_loop(
    listener: TcpListener,
    requests: mpsc::UnboundedSender<InboundRequest>,
    address: String,
) {
    loop {
        match listener.accept().await {
            Ok((socket, remote)) => {
                let requests = requests.clone();
                let address = address.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, remote.to_string(), requests).await {
                        debug!("[{}] Connection from {} failed: {}", address, remote, e);
                    }
                });
            }
            Err(e) => {
                error!("[{}] Failed to accept connection: {}", address, e);
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    remote: String,
    requests: mpsc::UnboundedSender<InboundRequest>,
) -> Result<(), HostError> {
    let mut buffer = Vec::new();
    timeout(DEFAULT_TIMEOUT, socket.read_to_end(&mut buffer))
        .await
        .map_err(|_| HostError::Timeout(remote.clone()))??;
    let message: DhtMessage = bincode::deserialize(&buffer)?;

    let (respond, response) = oneshot::channel();
    requests
        .send(InboundRequest {
            from: remote.clone(),
            message,
            respond,
        })
        .map_err(|_| HostError::Closed)?;

    let response = response.await.map_err(|_| HostError::Dropped(remote))?;
    socket.write_all(&bincode::serialize(&response)?).await?;
    Ok(())
}

#[async_trait]
impl Host for TcpHost {
    fn info(&self) -> PeerInfo {
        self.info.clone()
    }

    async fn call(&self, address: &str, message: DhtMessage) -> Result<DhtMessage, HostError> {
        if self
            .listener_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(HostError::Closed);
        }
        self.call_with_retry(address, message).await
    }

    fn take_incoming(&self) -> Option<InboundReceiver> {
        self.incoming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn close(&self) {
        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            debug!("[{}] Listener stopped", self.info.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_limiter_caps_per_host() {
        let mut limiter = ConnectionLimiter::new(2);
        assert!(limiter.try_acquire("a:1"));
        assert!(limiter.try_acquire("a:1"));
        assert!(!limiter.try_acquire("a:1"));
        assert!(limiter.try_acquire("b:1"));

        limiter.release("a:1");
        assert!(limiter.try_acquire("a:1"));
    }

    #[tokio::test]
    async fn test_request_response_over_loopback() {
        let server = TcpHost::bind(&PrivateKey::generate(), "127.0.0.1:0").await.unwrap();
        let address = server.info().address;
        assert_ne!(address, "127.0.0.1:0");
        assert!(address.starts_with("127.0.0.1:"));
        let mut incoming = server.take_incoming().unwrap();
        assert!(server.take_incoming().is_none());

        let server_info = server.info();
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let _ = request.respond.send(DhtMessage::Pong {
                    from: server_info.clone(),
                });
            }
        });

        let client = TcpHost::bind(&PrivateKey::generate(), "127.0.0.1:0").await.unwrap();
        let response = client
            .call(
                &address,
                DhtMessage::Ping {
                    from: client.info(),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            DhtMessage::Pong {
                from: server.info()
            }
        );

        server.close().await;
        client.close().await;
        assert!(matches!(
            client.call(&address, DhtMessage::Ping { from: client.info() }).await,
            Err(HostError::Closed)
        ));
    }
}
