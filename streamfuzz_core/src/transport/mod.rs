//! Delivery of fuzzed streams to the target.
//!
//! A [`Transport`] pushes one payload to the target and hands back a
//! [`Channel`] describing that exchange. The channel is what a crash detector
//! looks at: it exposes the reply, a liveness probe that outlives the borrow of
//! the channel, and whatever the transport wants to keep as crash evidence.

mod command;
mod tcp;

pub use command::{
    CommandChannel, CommandTransport, CommandTransportConfig, ExitInfo, InputDelivery,
};
pub use tcp::{AgentChannel, ListenerTransport, TcpChannel, TcpTransport};

pub(crate) use command::{drain, isolate, wait_with_timeout};

use crate::evidence::EvidenceEntry;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failures while talking to the target. None of these is a crash verdict on its own.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Could not connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Could not bind listener on {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Target did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },

    #[error("Transport misconfigured: {0}")]
    Config(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A zero-argument liveness check, detached from the channel it came from.
pub type LivenessProbe = Box<dyn FnMut() -> bool + Send>;

/// The result of a single delivery.
pub trait Channel: Send {
    /// Human-readable description of the other side.
    fn peer(&self) -> String;

    /// Bytes the target sent back during the exchange.
    fn response(&self) -> &[u8];

    fn liveness_probe(&self) -> LivenessProbe;

    /// Material worth archiving if the target turns out to be dead.
    fn evidence_entries(&self) -> Vec<EvidenceEntry>;
}

pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Sends `payload` to the target and returns the resulting channel.
    fn deliver(&mut self, payload: &mut dyn Read) -> Result<Box<dyn Channel>, TransportError>;

    /// Moves the local endpoint. Transports without one ignore this.
    fn set_endpoint(&mut self, _endpoint: SocketAddr) {}
}

/// Replies longer than this are cut off.
pub(crate) const MAX_RESPONSE_LEN: usize = 1 << 20;

/// Reads until EOF, or until the peer stays quiet for the configured read timeout.
///
/// A peer that never stops talking is cut off once `deadline` passes or `limit`
/// bytes have arrived, whichever comes first.
pub(crate) fn read_until_quiet<R: Read>(
    reader: &mut R,
    deadline: Instant,
    limit: usize,
) -> io::Result<Vec<u8>> {
    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    while response.len() < limit {
        if Instant::now() >= deadline {
            log::debug!("Reply still streaming at the deadline, keeping {} bytes", response.len());
            break;
        }
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit - response.len();
                response.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if is_timeout(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(response)
}

/// Signals end of input to the peer. A peer that already hung up is not an error here.
pub(crate) fn close_write(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Write) {
        log::debug!("Could not half-close the connection: {e}");
    }
}

pub(crate) fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub(crate) fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
