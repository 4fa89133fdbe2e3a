//! UDP packet-arrival listeners, one per channel
//!
//! A listener only records that datagrams arrive; payload is discarded. Its
//! lifecycle is independent of the encoder so that a channel can be observed
//! as present or missing before anything is started.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{LISTENER_STOP_TIMEOUT, UDP_RECV_BUFFER_SIZE};
use crate::error::BindError;
use crate::network::create_udp_socket;
use crate::stats::ListenerStats;

/// Liveness of a channel's listener as seen by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerReading {
    NotRunning,
    /// Receive loop ended on a socket error
    Failed(String),
    Active { last_packet_age: Option<Duration> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStart {
    Started(SocketAddr),
    AlreadyRunning,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no listener running")]
pub struct NotRunning;

#[derive(Default)]
struct ListenerShared {
    stats: Mutex<ListenerStats>,
    failure: Mutex<Option<String>>,
}

impl ListenerShared {
    fn record(&self, len: usize) {
        lock(&self.stats).record(len, Instant::now());
    }

    fn fail(&self, reason: String) {
        *lock(&self.failure) = Some(reason);
    }
}

struct ListenerEntry {
    shared: Arc<ListenerShared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct UdpWatcher {
    listeners: Mutex<HashMap<String, ListenerEntry>>,
}

impl UdpWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind and start the receive loop for `channel`. Idempotent while a loop is alive.
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        channel: &str,
        bind_ip: &str,
        port: u16,
        group: Option<Ipv4Addr>,
    ) -> Result<ListenerStart, BindError> {
        let mut listeners = lock(&self.listeners);
        let alive = listeners
            .get(channel)
            .map(|entry| !entry.task.is_finished() && lock(&entry.shared.failure).is_none());
        match alive {
            Some(true) => {
                debug!(channel, "listener already running");
                return Ok(ListenerStart::AlreadyRunning);
            }
            // dead loop: its socket is already gone, replace the entry
            Some(false) => {
                if let Some(stale) = listeners.remove(channel) {
                    stale.cancel.cancel();
                }
            }
            None => {}
        }

        let socket = create_udp_socket(bind_ip, port, group)?;
        let addr = format!("{bind_ip}:{port}");
        let socket = UdpSocket::from_std(socket.into())
            .map_err(|source| BindError::Io { addr: addr.clone(), source })?;
        let local = socket
            .local_addr()
            .map_err(|source| BindError::Io { addr, source })?;

        let shared = Arc::new(ListenerShared::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            channel.to_string(),
            socket,
            Arc::clone(&shared),
            cancel.clone(),
        ));
        listeners.insert(
            channel.to_string(),
            ListenerEntry { shared, cancel, task },
        );
        info!(channel, %local, multicast = ?group, "UDP listener bound");
        Ok(ListenerStart::Started(local))
    }

    /// Stop the loop and release the socket. When this returns the port is free.
    /// Returns whether a listener existed.
    pub async fn stop(&self, channel: &str) -> bool {
        let Some(entry) = lock(&self.listeners).remove(channel) else {
            debug!(channel, "no listener to stop");
            return false;
        };
        entry.cancel.cancel();

        let mut task = entry.task;
        if tokio::time::timeout(LISTENER_STOP_TIMEOUT, &mut task).await.is_err() {
            warn!(channel, "listener did not stop within {:?}, aborting", LISTENER_STOP_TIMEOUT);
            task.abort();
            let _ = task.await;
        }
        info!(channel, "UDP listener stopped");
        true
    }

    pub async fn stop_all(&self) {
        for channel in self.channels() {
            self.stop(&channel).await;
        }
    }

    pub fn reading(&self, channel: &str) -> ListenerReading {
        let listeners = lock(&self.listeners);
        let Some(entry) = listeners.get(channel) else {
            return ListenerReading::NotRunning;
        };
        if let Some(reason) = lock(&entry.shared.failure).clone() {
            return ListenerReading::Failed(reason);
        }
        if entry.task.is_finished() {
            return ListenerReading::Failed("listener task ended unexpectedly".to_string());
        }
        ListenerReading::Active {
            last_packet_age: lock(&entry.shared.stats).last_packet_age(Instant::now()),
        }
    }

    pub fn last_packet_age(&self, channel: &str) -> Result<Option<Duration>, NotRunning> {
        match self.reading(channel) {
            ListenerReading::Active { last_packet_age } => Ok(last_packet_age),
            _ => Err(NotRunning),
        }
    }

    pub fn stats(&self, channel: &str) -> Option<ListenerStats> {
        lock(&self.listeners)
            .get(channel)
            .map(|entry| lock(&entry.shared.stats).clone())
    }

    pub fn is_running(&self, channel: &str) -> bool {
        matches!(self.reading(channel), ListenerReading::Active { .. })
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.listeners).keys().cloned().collect()
    }
}

async fn receive_loop(
    channel: String,
    socket: UdpSocket,
    shared: Arc<ListenerShared>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(channel = %channel, "listener received stop signal");
                break;
            }
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, _)) => shared.record(n),
                Err(err) if is_transient(&err) => {
                    debug!(channel = %channel, error = %err, "transient receive error");
                }
                Err(err) => {
                    error!(channel = %channel, error = %err, "UDP listener failed, input marked unavailable");
                    shared.fail(err.to_string());
                    break;
                }
            }
        }
    }
}

/// WSAEMSGSIZE: Windows reports a truncated datagram as an error
const WINDOWS_MSG_SIZE: i32 = 10040;

fn is_transient(err: &io::Error) -> bool {
    if cfg!(windows) && err.raw_os_error() == Some(WINDOWS_MSG_SIZE) {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionReset
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket as StdUdpSocket;

    fn free_port() -> u16 {
        let probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    async fn wait_for_packet(watcher: &UdpWatcher, channel: &str) -> Option<Duration> {
        for _ in 0..100 {
            if let Ok(Some(age)) = watcher.last_packet_age(channel) {
                return Some(age);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let watcher = UdpWatcher::new();
        let port = free_port();

        let first = watcher.start("ch1", "127.0.0.1", port, None).unwrap();
        assert!(matches!(first, ListenerStart::Started(addr) if addr.port() == port));
        let second = watcher.start("ch1", "127.0.0.1", port, None).unwrap();
        assert_eq!(second, ListenerStart::AlreadyRunning);
        assert_eq!(watcher.channels(), vec!["ch1".to_string()]);

        watcher.stop("ch1").await;
    }

    #[tokio::test]
    async fn packets_refresh_last_arrival() {
        let watcher = UdpWatcher::new();
        let port = free_port();
        watcher.start("ch1", "127.0.0.1", port, None).unwrap();
        assert_eq!(
            watcher.reading("ch1"),
            ListenerReading::Active { last_packet_age: None }
        );

        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x47; 188], ("127.0.0.1", port)).unwrap();

        let age = wait_for_packet(&watcher, "ch1").await.expect("packet recorded");
        assert!(age < Duration::from_secs(1));
        let stats = watcher.stats("ch1").unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.bytes, 188);

        watcher.stop("ch1").await;
    }

    #[tokio::test]
    async fn jumbo_datagram_is_counted_whole() {
        let watcher = UdpWatcher::new();
        let port = free_port();
        watcher.start("ch1", "127.0.0.1", port, None).unwrap();

        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0x47; 9_024], ("127.0.0.1", port)).unwrap();

        wait_for_packet(&watcher, "ch1").await.expect("packet recorded");
        assert_eq!(watcher.stats("ch1").unwrap().bytes, 9_024);
        assert!(matches!(watcher.reading("ch1"), ListenerReading::Active { .. }));

        watcher.stop("ch1").await;
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let watcher = UdpWatcher::new();
        let port = free_port();
        watcher.start("ch1", "127.0.0.1", port, None).unwrap();

        assert!(watcher.stop("ch1").await);
        assert_eq!(watcher.reading("ch1"), ListenerReading::NotRunning);
        assert_eq!(watcher.last_packet_age("ch1"), Err(NotRunning));

        // plain bind without SO_REUSEADDR only succeeds once our socket is closed
        StdUdpSocket::bind(("127.0.0.1", port)).expect("port reusable after stop");

        assert!(!watcher.stop("ch1").await);
    }

    #[tokio::test]
    async fn restart_after_stop_binds_again() {
        let watcher = UdpWatcher::new();
        let port = free_port();
        watcher.start("ch1", "127.0.0.1", port, None).unwrap();
        watcher.stop("ch1").await;

        let again = watcher.start("ch1", "127.0.0.1", port, None).unwrap();
        assert!(matches!(again, ListenerStart::Started(_)));
        watcher.stop_all().await;
        assert!(watcher.channels().is_empty());
    }

    #[tokio::test]
    async fn busy_port_is_not_registered() {
        let watcher = UdpWatcher::new();
        let holder = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let err = watcher.start("ch1", "127.0.0.1", port, None).unwrap_err();
        assert!(matches!(err, BindError::PortInUse { .. }));
        assert_eq!(watcher.reading("ch1"), ListenerReading::NotRunning);
    }
}
