//! Conflate-to-latest transport.
//!
//! Each direction is one TCP stream carrying length-prefixed frames. Both
//! ends keep a single latest slot (`tokio::sync::watch`): the sender's writer
//! task only ever flushes the newest published payload, and the receiver's
//! reader task overwrites its slot on every frame. Nothing queues, and the
//! control loops only touch the slots, so they never block on the network.

use crate::error::RelayError;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_millis(500);
const RECONNECT_BASE_MS: u64 = 50;
const RECONNECT_MAX_MS: u64 = 1_000;
const CONNECT_POLL: Duration = Duration::from_millis(10);

type Slot = Option<Arc<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Command,
    Observation,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Command => f.write_str("command"),
            Channel::Observation => f.write_str("observation"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Bind(SocketAddr),
    /// `host:port`, resolved on every connection attempt.
    Connect(String),
}

/// Outcome of a non-blocking publish.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to the writer; replaces anything it had not flushed yet.
    Delivered,
    /// No receiver attached; the payload was dropped.
    WouldBlock,
    /// Empty or longer than `MAX_FRAME_LEN`; dropped without touching the
    /// connection.
    Rejected,
}

/// Whether a payload of `len` bytes fits in one frame.
pub fn is_frameable(len: usize) -> bool {
    len > 0 && len <= MAX_FRAME_LEN
}

pub trait LatestSink {
    fn publish(&self, payload: Vec<u8>) -> SendStatus;

    /// Release the endpoint. Must be safe to call more than once.
    fn close(&mut self) {}
}

pub trait LatestSource {
    /// Newest payload that arrived since the previous successful call.
    fn try_receive_latest(&mut self) -> Option<Vec<u8>>;

    /// Release the endpoint. Must be safe to call more than once.
    fn close(&mut self) {}
}

/// Backoff between connection attempts: 50 ms doubling up to 1 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let ms = RECONNECT_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(RECONNECT_MAX_MS);
    Duration::from_millis(ms)
}

/// Length-prefixed (u32 LE) frame write.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len();
    if !is_frameable(len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {len} bytes cannot be sent"),
        ));
    }
    w.write_all(&(len as u32).to_le_bytes()).await?;
    w.write_all(payload).await?;
    w.flush().await
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if !is_frameable(len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid frame length {len}"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

enum Acceptor {
    Listener(TcpListener),
    Dialer(String),
}

impl Acceptor {
    async fn open(endpoint: Endpoint) -> io::Result<Self> {
        Ok(match endpoint {
            Endpoint::Bind(addr) => Acceptor::Listener(TcpListener::bind(addr).await?),
            Endpoint::Connect(addr) => Acceptor::Dialer(addr),
        })
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Acceptor::Listener(l) => l.local_addr().ok(),
            Acceptor::Dialer(_) => None,
        }
    }

    /// Waits for the first usable peer, retrying forever.
    async fn establish(&self, channel: Channel) -> TcpStream {
        let mut attempt = 0u32;
        loop {
            let result = match self {
                Acceptor::Listener(l) => l.accept().await.map(|(s, _)| s),
                Acceptor::Dialer(addr) => TcpStream::connect(addr.as_str()).await,
            };
            match result {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    if let Ok(peer) = stream.peer_addr() {
                        tracing::info!("{channel} channel: peer {peer} attached");
                    }
                    return stream;
                }
                Err(e) => {
                    if attempt == 0 {
                        tracing::debug!("{channel} channel: connection attempt failed: {e}");
                    }
                    sleep(reconnect_delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// A bound endpoint hands the channel to whichever peer connected last.
    /// Dialers never get a replacement.
    async fn replacement(&self, channel: Channel) -> TcpStream {
        match self {
            Acceptor::Listener(_) => self.establish(channel).await,
            Acceptor::Dialer(_) => std::future::pending().await,
        }
    }
}

pub struct LatestSender {
    channel: Channel,
    latest: watch::Sender<Slot>,
    connected: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl LatestSender {
    pub async fn open(channel: Channel, endpoint: Endpoint) -> Result<Self, RelayError> {
        let acceptor = Acceptor::open(endpoint).await?;
        let local_addr = acceptor.local_addr();
        let (latest, rx) = watch::channel(None);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(writer_task(channel, acceptor, rx, connected.clone()));
        Ok(Self {
            channel,
            latest,
            connected,
            local_addr,
            task: Some(task),
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl LatestSink for LatestSender {
    fn publish(&self, payload: Vec<u8>) -> SendStatus {
        if !is_frameable(payload.len()) {
            return SendStatus::Rejected;
        }
        if !self.is_connected() {
            return SendStatus::WouldBlock;
        }
        self.latest.send_replace(Some(Arc::new(payload)));
        SendStatus::Delivered
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("{} channel sender closed", self.channel);
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for LatestSender {
    fn drop(&mut self) {
        LatestSink::close(self);
    }
}

async fn writer_task(
    channel: Channel,
    acceptor: Acceptor,
    mut latest: watch::Receiver<Slot>,
    connected: Arc<AtomicBool>,
) {
    let mut stream = acceptor.establish(channel).await;
    loop {
        // Whatever was published while detached is already stale.
        drop(latest.borrow_and_update());
        connected.store(true, Ordering::Release);

        loop {
            tokio::select! {
                changed = latest.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let Some(payload) = latest.borrow_and_update().clone() else {
                        continue;
                    };
                    match timeout(WRITE_TIMEOUT, write_frame(&mut stream, &payload)).await {
                        Ok(Ok(())) => {}
                        // Nothing was written, the stream is still in sync.
                        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidInput => {
                            tracing::warn!("{channel} channel: skipped payload: {e}");
                        }
                        Ok(Err(e)) => {
                            tracing::debug!("{channel} channel: write failed: {e}");
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(
                                "{channel} channel: receiver stalled for {:?}, dropping it",
                                WRITE_TIMEOUT
                            );
                            break;
                        }
                    }
                }
                peer = acceptor.replacement(channel) => {
                    stream = peer;
                }
            }
        }

        connected.store(false, Ordering::Release);
        tracing::info!("{channel} channel: receiver detached");
        stream = acceptor.establish(channel).await;
    }
}

pub struct LatestReceiver {
    channel: Channel,
    latest: watch::Receiver<Slot>,
    connected: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl LatestReceiver {
    pub async fn open(channel: Channel, endpoint: Endpoint) -> Result<Self, RelayError> {
        let acceptor = Acceptor::open(endpoint).await?;
        let local_addr = acceptor.local_addr();
        let (tx, latest) = watch::channel(None);
        let connected = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(reader_task(channel, acceptor, tx, connected.clone()));
        Ok(Self {
            channel,
            latest,
            connected,
            local_addr,
            task: Some(task),
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl LatestSource for LatestReceiver {
    fn try_receive_latest(&mut self) -> Option<Vec<u8>> {
        take_latest(&mut self.latest)
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("{} channel receiver closed", self.channel);
        }
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for LatestReceiver {
    fn drop(&mut self) {
        LatestSource::close(self);
    }
}

fn take_latest(latest: &mut watch::Receiver<Slot>) -> Option<Vec<u8>> {
    match latest.has_changed() {
        Ok(true) => latest.borrow_and_update().as_deref().cloned(),
        _ => None,
    }
}

async fn reader_task(
    channel: Channel,
    acceptor: Acceptor,
    latest: watch::Sender<Slot>,
    connected: Arc<AtomicBool>,
) {
    let mut stream = acceptor.establish(channel).await;
    loop {
        connected.store(true, Ordering::Release);

        loop {
            tokio::select! {
                frame = read_frame(&mut stream) => match frame {
                    Ok(payload) => {
                        latest.send_replace(Some(Arc::new(payload)));
                    }
                    Err(e) => {
                        tracing::debug!("{channel} channel: read failed: {e}");
                        break;
                    }
                },
                peer = acceptor.replacement(channel) => {
                    stream = peer;
                }
            }
        }

        connected.store(false, Ordering::Release);
        tracing::info!("{channel} channel: sender detached");
        stream = acceptor.establish(channel).await;
    }
}

/// In-process pair with the same conflate semantics as the TCP transport.
pub fn loopback() -> (LoopbackSender, LoopbackReceiver) {
    let (tx, rx) = watch::channel(None);
    (LoopbackSender { latest: tx }, LoopbackReceiver { latest: rx })
}

pub struct LoopbackSender {
    latest: watch::Sender<Slot>,
}

impl LatestSink for LoopbackSender {
    fn publish(&self, payload: Vec<u8>) -> SendStatus {
        if !is_frameable(payload.len()) {
            return SendStatus::Rejected;
        }
        if self.latest.is_closed() {
            return SendStatus::WouldBlock;
        }
        self.latest.send_replace(Some(Arc::new(payload)));
        SendStatus::Delivered
    }
}

pub struct LoopbackReceiver {
    latest: watch::Receiver<Slot>,
}

impl LatestSource for LoopbackReceiver {
    fn try_receive_latest(&mut self) -> Option<Vec<u8>> {
        take_latest(&mut self.latest)
    }
}

/// Both directions of one side of the relay.
pub struct RelayLink<Tx, Rx> {
    pub tx: Tx,
    pub rx: Rx,
}

pub type TcpLink = RelayLink<LatestSender, LatestReceiver>;

impl<Tx: LatestSink, Rx: LatestSource> RelayLink<Tx, Rx> {
    /// Safe to call repeatedly.
    pub fn close(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

impl TcpLink {
    /// Host side: receives commands, sends observations, binds both ports.
    pub async fn open_host(
        bind: IpAddr,
        cmd_port: u16,
        obs_port: u16,
    ) -> Result<Self, RelayError> {
        let rx = LatestReceiver::open(
            Channel::Command,
            Endpoint::Bind(SocketAddr::new(bind, cmd_port)),
        )
        .await?;
        // If this bind fails, `rx` is dropped and closes itself.
        let tx = LatestSender::open(
            Channel::Observation,
            Endpoint::Bind(SocketAddr::new(bind, obs_port)),
        )
        .await?;
        tracing::info!(
            "listening for commands on {bind}:{cmd_port}, \
             publishing observations on {bind}:{obs_port}"
        );
        Ok(Self { tx, rx })
    }

    /// Client side: sends commands, receives observations.
    pub async fn open_client(
        remote: &str,
        cmd_port: u16,
        obs_port: u16,
    ) -> Result<Self, RelayError> {
        let tx = LatestSender::open(
            Channel::Command,
            Endpoint::Connect(format!("{remote}:{cmd_port}")),
        )
        .await?;
        let rx = LatestReceiver::open(
            Channel::Observation,
            Endpoint::Connect(format!("{remote}:{obs_port}")),
        )
        .await?;
        Ok(Self { tx, rx })
    }

    pub fn is_connected(&self) -> bool {
        self.tx.is_connected() && self.rx.is_connected()
    }

    /// Bounded wait until both channels report a peer.
    pub async fn wait_connected(&self, limit: Duration, peer: &str) -> Result<(), RelayError> {
        let deadline = Instant::now() + limit;
        while !self.is_connected() {
            if Instant::now() >= deadline {
                let channel = if self.tx.is_connected() {
                    self.rx.channel()
                } else {
                    self.tx.channel()
                };
                return Err(RelayError::ConnectTimeout {
                    channel,
                    peer: peer.to_string(),
                    timeout: limit,
                });
            }
            sleep(CONNECT_POLL).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_millis(50));
        assert_eq!(reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(reconnect_delay(4), Duration::from_millis(800));
        assert_eq!(reconnect_delay(5), Duration::from_millis(1_000));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn loopback_keeps_only_the_newest_payload() {
        let (tx, mut rx) = loopback();
        assert_eq!(rx.try_receive_latest(), None);
        for i in 1..=5u8 {
            assert_eq!(tx.publish(vec![i]), SendStatus::Delivered);
        }
        assert_eq!(rx.try_receive_latest(), Some(vec![5]));
        assert_eq!(rx.try_receive_latest(), None);
    }

    #[test]
    fn loopback_without_receiver_would_block() {
        let (tx, rx) = loopback();
        drop(rx);
        assert_eq!(tx.publish(vec![1]), SendStatus::WouldBlock);
    }

    #[test]
    fn loopback_rejects_unframeable_payloads() {
        let (tx, mut rx) = loopback();
        assert_eq!(tx.publish(Vec::new()), SendStatus::Rejected);
        assert_eq!(tx.publish(vec![0u8; MAX_FRAME_LEN + 1]), SendStatus::Rejected);
        assert_eq!(rx.try_receive_latest(), None);
        assert_eq!(tx.publish(vec![7]), SendStatus::Delivered);
        assert_eq!(rx.try_receive_latest(), Some(vec![7]));
    }

    proptest! {
        #[test]
        fn loopback_conflates_to_the_last_publish(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..40)
        ) {
            let (tx, mut rx) = loopback();
            for p in &payloads {
                prop_assert_eq!(tx.publish(p.clone()), SendStatus::Delivered);
            }
            let latest = rx.try_receive_latest();
            prop_assert_eq!(latest.as_ref(), payloads.last());
            prop_assert_eq!(rx.try_receive_latest(), None);
        }
    }

    #[tokio::test]
    async fn frames_reject_bad_lengths() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_le_bytes());
        let mut cursor = &buf[..];
        assert_eq!(read_frame(&mut cursor).await.unwrap(), b"hello");

        let zero = 0u32.to_le_bytes();
        let mut cursor = &zero[..];
        assert!(read_frame(&mut cursor).await.is_err());
        assert!(write_frame(&mut Vec::<u8>::new(), b"").await.is_err());
    }

    #[tokio::test]
    async fn publish_without_receiver_never_blocks() {
        let tx = LatestSender::open(
            Channel::Observation,
            Endpoint::Bind(SocketAddr::new(LOCALHOST, 0)),
        )
        .await
        .unwrap();
        let start = std::time::Instant::now();
        for _ in 0..1_000 {
            assert_eq!(tx.publish(vec![0u8; 1024]), SendStatus::WouldBlock);
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    async fn connected_pair() -> (TcpLink, TcpLink) {
        let host = TcpLink::open_host(LOCALHOST, 0, 0).await.unwrap();
        let cmd_port = host.rx.local_addr().unwrap().port();
        let obs_port = host.tx.local_addr().unwrap().port();
        let client = TcpLink::open_client("127.0.0.1", cmd_port, obs_port)
            .await
            .unwrap();
        client
            .wait_connected(Duration::from_secs(5), "127.0.0.1")
            .await
            .unwrap();
        host.wait_connected(Duration::from_secs(5), "client")
            .await
            .unwrap();
        (host, client)
    }

    #[tokio::test]
    async fn receiver_sees_only_the_most_recent_command() {
        let (mut host, client) = connected_pair().await;
        let first = br#"{"arm1_joint0":10}"#.to_vec();
        let second = br#"{"arm1_joint0":20}"#.to_vec();
        assert_eq!(client.tx.publish(first), SendStatus::Delivered);
        assert_eq!(client.tx.publish(second), SendStatus::Delivered);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(
            host.rx.try_receive_latest(),
            Some(br#"{"arm1_joint0":20}"#.to_vec())
        );
        assert_eq!(host.rx.try_receive_latest(), None);
    }

    #[tokio::test]
    async fn burst_of_publishes_surfaces_the_last_one() {
        let (host, mut client) = connected_pair().await;
        for i in 0..100u32 {
            let _ = host.tx.publish(i.to_le_bytes().to_vec());
        }
        sleep(Duration::from_millis(200)).await;
        assert_eq!(client.rx.try_receive_latest(), Some(99u32.to_le_bytes().to_vec()));
    }

    #[tokio::test]
    async fn unframeable_payload_keeps_the_receiver_attached() {
        let (host, mut client) = connected_pair().await;
        assert_eq!(host.tx.publish(Vec::new()), SendStatus::Rejected);
        assert_eq!(host.tx.publish(vec![0u8; MAX_FRAME_LEN + 1]), SendStatus::Rejected);
        sleep(Duration::from_millis(100)).await;
        assert!(host.tx.is_connected());
        assert!(client.rx.is_connected());

        assert_eq!(host.tx.publish(b"next".to_vec()), SendStatus::Delivered);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(client.rx.try_receive_latest(), Some(b"next".to_vec()));
    }

    #[tokio::test]
    async fn connect_timeout_names_the_channel() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind((LOCALHOST, 0))
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = TcpLink::open_client("127.0.0.1", port, port).await.unwrap();
        let err = client
            .wait_connected(Duration::from_millis(100), "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::ConnectTimeout { channel: Channel::Command, .. }
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut host, _client) = connected_pair().await;
        host.close();
        host.close();
        assert!(!host.is_connected());
        assert_eq!(host.tx.publish(vec![1]), SendStatus::WouldBlock);
    }
}
