//! Line channel to the site manager.
//!
//! The channel holds one persistent down-connection, read by a single
//! background task that splits the byte stream into `\n`-terminated records
//! and hands each to the line hook in arrival order. Commands never travel
//! on the down-connection: every `send` opens a fresh connection to the
//! up-port, writes one framed record and shuts it down.
//!
//! **Panic-Free Policy:** no `.unwrap()` or `.expect()` outside tests.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use tbm_protocol::encode_command;

use crate::config::GatewayConfig;
use crate::error::{MonitorError, Result};

/// Longest record accepted from the down-channel, terminator excluded.
///
/// Longer records are dropped up to their terminator.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Hook receiving every complete record, without its terminator.
pub type LineHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection state of the down-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never connected, or disconnected on request
    Disconnected,
    /// Reader running
    Connected,
    /// The site manager closed the stream or it failed
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct Reader {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Connection to the site manager.
pub struct LineChannel {
    gateway: GatewayConfig,
    reader: Mutex<Option<Reader>>,
    state: Arc<watch::Sender<ChannelState>>,
}

impl LineChannel {
    pub fn new(gateway: GatewayConfig) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            gateway,
            reader: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn gateway(&self) -> &GatewayConfig {
        &self.gateway
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Opens the down-connection and starts the reader.
    ///
    /// `on_line` runs on the reader task for every record. Fails with
    /// `AlreadyConnected` while a reader is running. A channel that was
    /// closed by the site manager may be connected again.
    pub async fn connect(&self, on_line: LineHook) -> Result<()> {
        let mut reader = self.reader.lock().await;

        if let Some(previous) = reader.take() {
            if !previous.handle.is_finished() {
                *reader = Some(previous);
                return Err(MonitorError::AlreadyConnected);
            }
        }

        let addr = self.gateway.down_addr();
        let stream = open(&addr, &self.gateway).await?;
        info!(%addr, "Connected to site manager");

        let cancel = CancellationToken::new();
        self.state.send_replace(ChannelState::Connected);
        let handle = tokio::spawn(read_loop(
            stream,
            on_line,
            cancel.clone(),
            Arc::clone(&self.state),
        ));

        *reader = Some(Reader { cancel, handle });
        Ok(())
    }

    /// Stops the reader and closes the down-connection.
    ///
    /// Waits for the reader to finish. Idempotent.
    pub async fn disconnect(&self) {
        let Some(reader) = self.reader.lock().await.take() else {
            return;
        };

        reader.cancel.cancel();
        if let Err(e) = reader.handle.await {
            warn!(error = %e, "Reader task ended abnormally");
        }
        self.state.send_replace(ChannelState::Disconnected);
        info!("Disconnected from site manager");
    }

    /// Sends one command to the node client at `ip:port`.
    ///
    /// `payload` must end with the only newline it contains; anything else
    /// is rejected with `InvalidCommand` before connecting. `period` asks the
    /// site manager to repeat the command; `0` delivers it once.
    pub async fn send(&self, ip: &str, port: u16, payload: &str, period: u32) -> Result<()> {
        let record = encode_command(period, ip, port, payload)?;

        let addr = self.gateway.up_addr();
        let mut stream = open(&addr, &self.gateway).await?;
        stream.write_all(record.as_bytes()).await?;
        stream.shutdown().await?;

        debug!(%ip, port, period, command = payload.trim_end(), "Sent command");
        Ok(())
    }
}

impl fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineChannel")
            .field("gateway", &self.gateway)
            .field("state", &self.state())
            .finish()
    }
}

async fn open(addr: &str, gateway: &GatewayConfig) -> Result<TcpStream> {
    match timeout(gateway.connect_timeout(), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(MonitorError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(MonitorError::ConnectTimeout {
            addr: addr.to_string(),
        }),
    }
}

/// Resolves once the channel is lost for a waiter armed now.
///
/// A channel that is connected when armed is lost when it stops being
/// connected. Otherwise only a close by the site manager counts; a channel
/// that was never connected never resolves this.
pub(crate) async fn lost(mut state: watch::Receiver<ChannelState>) {
    let armed = *state.borrow_and_update();
    loop {
        let current = *state.borrow_and_update();
        let gone = current == ChannelState::Closed
            || (armed == ChannelState::Connected && current != ChannelState::Connected);
        if gone {
            return;
        }
        if state.changed().await.is_err() {
            if armed == ChannelState::Connected {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

async fn read_loop(
    stream: TcpStream,
    on_line: LineHook,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ChannelState>>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut discarding = false;

    loop {
        // One byte past the limit tells an oversize record from a full one
        let room = (MAX_LINE_LENGTH + 1).saturating_sub(buf.len()) as u64;
        let mut limited = (&mut reader).take(room);

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader cancelled");
                return;
            }
            result = limited.read_until(b'\n', &mut buf) => result,
        };

        match read {
            Ok(0) => {
                if !buf.is_empty() {
                    warn!(bytes = buf.len(), "Discarding partial record at end of stream");
                }
                break;
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    if discarding {
                        discarding = false;
                    } else {
                        let line = strip_terminator(&buf);
                        trace!(line = %line, "Received record");
                        on_line(&line);
                    }
                    buf.clear();
                } else if buf.len() > MAX_LINE_LENGTH {
                    if !discarding {
                        warn!(limit = MAX_LINE_LENGTH, "Discarding oversize record");
                        discarding = true;
                    }
                    buf.clear();
                }
            }
            Err(e) => {
                warn!(error = %e, "Down-channel read failed");
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        state.send_replace(ChannelState::Closed);
        warn!("Site manager closed the down-channel");
    }
}

fn strip_terminator(buf: &[u8]) -> Cow<'_, str> {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn gateway_on(listener: &TcpListener) -> GatewayConfig {
        let port = listener.local_addr().unwrap().port();
        GatewayConfig {
            host: "127.0.0.1".to_string(),
            up_port: port,
            down_port: port,
            connect_timeout_ms: 2_000,
        }
    }

    fn collector() -> (LineHook, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hook: LineHook = Arc::new(move |line: &str| {
            let _ = tx.send(line.to_string());
        });
        (hook, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for line")
            .expect("hook dropped")
    }

    #[test]
    fn test_strip_terminator() {
        assert_eq!(strip_terminator(b"abc\n"), "abc");
        assert_eq!(strip_terminator(b"abc\r\n"), "abc");
        assert_eq!(strip_terminator(b"\n"), "");
        assert_eq!(strip_terminator(b"a\rb\n"), "a\rb");
    }

    #[tokio::test]
    async fn test_records_split_across_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = LineChannel::new(gateway_on(&listener).await);
        let (hook, mut rx) = collector();

        channel.connect(hook).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        server.write_all(b"first\nsec").await.unwrap();
        assert_eq!(next(&mut rx).await, "first");

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.write_all(b"ond\r\nthird\n").await.unwrap();
        assert_eq!(next(&mut rx).await, "second");
        assert_eq!(next(&mut rx).await, "third");

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_oversize_record_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = LineChannel::new(gateway_on(&listener).await);
        let (hook, mut rx) = collector();

        channel.connect(hook).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut junk = vec![b'x'; MAX_LINE_LENGTH + 10];
        junk.extend_from_slice(b"\nafter\n");
        server.write_all(&junk).await.unwrap();

        assert_eq!(next(&mut rx).await, "after");
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = LineChannel::new(gateway_on(&listener).await);
        let (hook, _rx) = collector();

        channel.connect(Arc::clone(&hook)).await.unwrap();
        let _server = listener.accept().await.unwrap();

        let err = channel.connect(hook).await.unwrap_err();
        assert!(matches!(err, MonitorError::AlreadyConnected));
        channel.disconnect().await;
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = LineChannel::new(gateway_on(&listener).await);
        let (hook, mut rx) = collector();
        let mut state = channel.watch_state();

        channel.connect(hook).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        server.write_all(b"last\npartial").await.unwrap();
        drop(server);

        assert_eq!(next(&mut rx).await, "last");
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ChannelState::Closed),
        )
        .await
        .expect("channel never closed")
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let channel = LineChannel::new(GatewayConfig::default());
        channel.disconnect().await;
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_frames_command() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = LineChannel::new(gateway_on(&listener).await);

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            received
        });

        channel
            .send("10.0.0.7", 5000, "CTRL_NET_DOWN_REQ\n", 0)
            .await
            .unwrap();
        assert_eq!(accept.await.unwrap(), "0 10.0.0.7 5000 CTRL_NET_DOWN_REQ\n");
    }

    #[tokio::test]
    async fn test_send_rejects_bad_payload_without_connecting() {
        // Nothing listens here; validation must fail first
        let gateway = GatewayConfig {
            host: "127.0.0.1".to_string(),
            up_port: 1,
            ..GatewayConfig::default()
        };
        let channel = LineChannel::new(gateway);

        let err = channel
            .send("10.0.0.7", 5000, "two\nlines\n", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidCommand { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = gateway_on(&listener).await;
        drop(listener);

        let channel = LineChannel::new(gateway);
        let (hook, _rx) = collector();
        let err = channel.connect(hook).await.unwrap_err();
        assert!(matches!(err, MonitorError::Connect { .. }));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
