// Native-messaging host bridge
//
// The browser launches the host with the extension on stdin/stdout. The host
// connects to the relay socket and pumps frames both ways, verbatim, until
// either side closes. It has no business logic of its own.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use super::framing::{framed_socket, FrameReader, FrameWriter};

/// Which side ended the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The extension closed stdin (browser tab or extension went away)
    Extension,
    /// The relay closed the socket
    Relay,
}

/// Outcome of a bridge run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSummary {
    pub ended_by: BridgeEnd,
    /// Frames forwarded by the side that ended the bridge
    pub forwarded: u64,
}

/// Forward frames from `from` to `to` until `from` closes or `to` breaks
async fn pump<R, W>(from: &mut FrameReader<R>, to: &FrameWriter<W>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut forwarded = 0;
    while let Some(frame) = from.read_frame().await {
        match to.write_frame(&frame).await {
            Ok(()) => forwarded += 1,
            Err(e) if e.is_fatal() => {
                debug!(from = %from.label(), to = %to.label(), "forward target closed: {}", e);
                break;
            }
            Err(e) => warn!(from = %from.label(), "dropping frame: {}", e),
        }
    }
    forwarded
}

/// Bridge an extension channel to a connected relay socket
pub async fn run_bridge<R, W>(
    mut extension_reader: FrameReader<R>,
    extension_writer: FrameWriter<W>,
    relay: UnixStream,
) -> BridgeSummary
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut relay_reader, relay_writer, _fd) = framed_socket(relay, "relay");

    let summary = tokio::select! {
        forwarded = pump(&mut extension_reader, &relay_writer) => BridgeSummary {
            ended_by: BridgeEnd::Extension,
            forwarded,
        },
        forwarded = pump(&mut relay_reader, &extension_writer) => BridgeSummary {
            ended_by: BridgeEnd::Relay,
            forwarded,
        },
    };

    info!(ended_by = ?summary.ended_by, forwarded = summary.forwarded, "Bridge closed");
    summary
}
