use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use focus_relay_lib::relay::authority::{Authorities, ScheduleCell};
use focus_relay_lib::relay::config::Config;
use focus_relay_lib::relay::framing::FrameReader;
use focus_relay_lib::relay::protocol::encode_frame;
use focus_relay_lib::relay::server::RelayServer;

/// How long a client waits for a message it expects
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a client listens to confirm nothing arrives
pub const SILENCE_WINDOW: Duration = Duration::from_millis(250);

/// An in-process relay listening in a private temp dir
pub struct TestRelay {
    pub server: RelayServer,
    pub schedule: Arc<ScheduleCell>,
    pub config: Config,
    _temp_dir: TempDir,
}

impl TestRelay {
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let config = Config::in_dir(temp_dir.path().to_path_buf());
        let schedule = Arc::new(ScheduleCell::default());
        let server = RelayServer::new(
            config.socket_path.clone(),
            Authorities::new(schedule.clone()),
        );
        server.start().await.expect("relay should start");

        Self {
            server,
            schedule,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Connect and complete a PING exchange, so the connection is registered
    pub async fn connect(&self) -> RelayClient {
        let mut client = RelayClient::connect(&self.config).await;
        client.handshake().await;
        client
    }
}

/// A raw extension-side connection
pub struct RelayClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RelayClient {
    pub async fn connect(config: &Config) -> Self {
        let stream = UnixStream::connect(&config.socket_path)
            .await
            .expect("connect to relay");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half, "test-client"),
            writer,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let frame = encode_frame(&message).expect("encodable message");
        self.send_raw(&frame).await;
    }

    /// Write bytes verbatim, bypassing framing checks
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write to relay");
        self.writer.flush().await.expect("flush to relay");
    }

    /// Length prefix followed by `body`, whatever its size or content
    pub async fn send_body(&mut self, body: &[u8]) {
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(body);
        self.send_raw(&frame).await;
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Option<Map<String, Value>> {
        tokio::time::timeout(timeout, self.reader.read_frame())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv(&mut self) -> Map<String, Value> {
        self.recv_within(RECV_TIMEOUT)
            .await
            .expect("relay should send a message")
    }

    /// Receive the next message and check its type
    pub async fn expect(&mut self, message_type: &str) -> Map<String, Value> {
        let message = self.recv().await;
        assert_eq!(
            message["type"], message_type,
            "unexpected message: {:?}",
            message
        );
        message
    }

    pub async fn expect_silence(&mut self) {
        if let Some(message) = self.recv_within(SILENCE_WINDOW).await {
            panic!("expected no message, got {:?}", message);
        }
    }

    /// PING, then consume PONG and the two snapshots that follow it
    pub async fn handshake(&mut self) {
        self.send(json!({"type": "PING"})).await;
        self.expect("PONG").await;
        self.expect("SESSION_SYNC").await;
        self.expect("SCHEDULE_SYNC").await;
    }

    /// True once the relay has closed this connection
    pub async fn is_closed(&mut self) -> bool {
        matches!(
            tokio::time::timeout(RECV_TIMEOUT, self.reader.read_frame()).await,
            Ok(None)
        )
    }
}
