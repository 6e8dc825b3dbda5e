use super::{
    Channel, LivenessProbe, MAX_RESPONSE_LEN, Transport, TransportError, close_write,
    is_disconnect, is_timeout, read_until_quiet,
};
use crate::evidence::EvidenceEntry;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Copies `payload` into `stream`. A write failure (the target hung up mid-stream)
/// ends the copy and is returned alongside the byte count; a read failure on the
/// payload side is a hard error.
fn pump(payload: &mut dyn Read, stream: &mut TcpStream) -> io::Result<(u64, Option<io::Error>)> {
    let mut chunk = [0u8; 8192];
    let mut sent = 0u64;
    loop {
        let n = match payload.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if let Err(e) = stream.write_all(&chunk[..n]) {
            return Ok((sent, Some(e)));
        }
        sent += n as u64;
    }
    Ok((sent, None))
}

fn transcript(peer: &str, sent: u64, response: &[u8], interrupted: Option<&str>) -> EvidenceEntry {
    let mut text = format!("peer: {peer}\nsent: {sent} bytes\nreceived: {} bytes\n", response.len());
    if let Some(reason) = interrupted {
        text.push_str(&format!("interrupted: {reason}\n"));
    }
    EvidenceEntry::new("transcript.txt", text.into_bytes())
}

/// Connects to a listening target for every delivery.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    endpoint: SocketAddr,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpTransport {
    pub fn new(endpoint: SocketAddr, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            io_timeout,
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "TcpTransport"
    }

    fn deliver(&mut self, payload: &mut dyn Read) -> Result<Box<dyn Channel>, TransportError> {
        let mut stream =
            TcpStream::connect_timeout(&self.endpoint, self.connect_timeout).map_err(|source| {
                TransportError::Connect {
                    endpoint: self.endpoint,
                    source,
                }
            })?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;

        let (sent, write_error) = pump(payload, &mut stream)?;
        close_write(&stream);
        let deadline = Instant::now() + self.io_timeout;
        let response = read_until_quiet(&mut stream, deadline, MAX_RESPONSE_LEN)?;
        if let Some(e) = &write_error {
            log::debug!("Target {} hung up after {sent} bytes: {e}", self.endpoint);
        }

        Ok(Box::new(TcpChannel {
            endpoint: self.endpoint,
            probe_timeout: self.connect_timeout,
            sent,
            response,
            interrupted: write_error.map(|e| e.to_string()),
        }))
    }
}

/// Outcome of a [`TcpTransport`] delivery. The target counts as alive while it
/// keeps accepting connections.
#[derive(Debug)]
pub struct TcpChannel {
    endpoint: SocketAddr,
    probe_timeout: Duration,
    sent: u64,
    response: Vec<u8>,
    interrupted: Option<String>,
}

impl Channel for TcpChannel {
    fn peer(&self) -> String {
        format!("tcp://{}", self.endpoint)
    }

    fn response(&self) -> &[u8] {
        &self.response
    }

    fn liveness_probe(&self) -> LivenessProbe {
        let endpoint = self.endpoint;
        let timeout = self.probe_timeout;
        Box::new(move || TcpStream::connect_timeout(&endpoint, timeout).is_ok())
    }

    fn evidence_entries(&self) -> Vec<EvidenceEntry> {
        vec![
            transcript(
                &self.peer(),
                self.sent,
                &self.response,
                self.interrupted.as_deref(),
            ),
            EvidenceEntry::new("response.bin", self.response.clone()),
        ]
    }
}

/// Serves payloads to agents that connect to the fuzzer's listen endpoint.
///
/// Each delivery waits for one agent connection, writes the payload, closes the
/// write half and collects the agent's reply. The agent is expected to hold the
/// connection open for as long as its target lives.
#[derive(Debug)]
pub struct ListenerTransport {
    endpoint: SocketAddr,
    listener: Option<TcpListener>,
    accept_timeout: Duration,
    io_timeout: Duration,
}

impl ListenerTransport {
    pub fn new(endpoint: SocketAddr, accept_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            endpoint,
            listener: None,
            accept_timeout,
            io_timeout,
        }
    }

    /// Address actually bound, binding first if needed. Useful with port 0.
    pub fn local_addr(&mut self) -> Result<SocketAddr, TransportError> {
        Ok(self.bound_listener()?.local_addr()?)
    }

    fn bound_listener(&mut self) -> Result<&TcpListener, TransportError> {
        if self.listener.is_none() {
            let listener = TcpListener::bind(self.endpoint).map_err(|source| {
                TransportError::Bind {
                    endpoint: self.endpoint,
                    source,
                }
            })?;
            listener.set_nonblocking(true)?;
            log::info!("Listening for agents on {}", listener.local_addr()?);
            self.listener = Some(listener);
        }
        self.listener
            .as_ref()
            .ok_or_else(|| TransportError::Config("listener unavailable".to_string()))
    }

    fn accept_agent(&mut self) -> Result<(TcpStream, SocketAddr), TransportError> {
        let timeout = self.accept_timeout;
        let listener = self.bound_listener()?;
        let started = Instant::now();
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    return Ok((stream, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(TransportError::Timeout(timeout));
                    }
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for ListenerTransport {
    fn name(&self) -> &'static str {
        "ListenerTransport"
    }

    fn deliver(&mut self, payload: &mut dyn Read) -> Result<Box<dyn Channel>, TransportError> {
        let (mut stream, agent) = self.accept_agent()?;
        log::debug!("Agent {agent} connected");
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;

        let (sent, write_error) = pump(payload, &mut stream)?;
        close_write(&stream);
        let deadline = Instant::now() + self.io_timeout;
        let response = match read_until_quiet(&mut stream, deadline, MAX_RESPONSE_LEN) {
            Ok(response) => response,
            Err(e) if is_disconnect(&e) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Box::new(AgentChannel {
            agent,
            stream,
            probe_timeout: self.io_timeout,
            sent,
            response,
            interrupted: write_error.map(|e| e.to_string()),
        }))
    }

    fn set_endpoint(&mut self, endpoint: SocketAddr) {
        if self.endpoint != endpoint {
            log::info!("Listen endpoint moved from {} to {endpoint}", self.endpoint);
            self.endpoint = endpoint;
            self.listener = None;
        }
    }
}

/// Outcome of a [`ListenerTransport`] delivery, holding the agent connection.
#[derive(Debug)]
pub struct AgentChannel {
    agent: SocketAddr,
    stream: TcpStream,
    probe_timeout: Duration,
    sent: u64,
    response: Vec<u8>,
    interrupted: Option<String>,
}

impl Channel for AgentChannel {
    fn peer(&self) -> String {
        format!("agent://{}", self.agent)
    }

    fn response(&self) -> &[u8] {
        &self.response
    }

    fn liveness_probe(&self) -> LivenessProbe {
        let stream = match self.stream.try_clone() {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Cannot probe agent {}: {e}", self.agent);
                return Box::new(|| false);
            }
        };
        let timeout = self.probe_timeout;
        Box::new(move || {
            let _ = stream.set_read_timeout(Some(timeout));
            let mut byte = [0u8; 1];
            match stream.peek(&mut byte) {
                Ok(0) => false,
                Ok(_) => true,
                Err(e) if is_timeout(&e) => true,
                Err(_) => false,
            }
        })
    }

    fn evidence_entries(&self) -> Vec<EvidenceEntry> {
        vec![
            transcript(
                &self.peer(),
                self.sent,
                &self.response,
                self.interrupted.as_deref(),
            ),
            EvidenceEntry::new("response.bin", self.response.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SHORT: Duration = Duration::from_millis(200);

    fn free_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn tcp_transport_delivers_and_probes() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = server.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = server.accept().unwrap();
            let mut request = Vec::new();
            conn.read_to_end(&mut request).unwrap();
            conn.write_all(b"ACK:").unwrap();
            conn.write_all(&request).unwrap();
            drop(conn);
            // Second connection is the liveness probe.
            let _ = server.accept().unwrap();
        });

        let mut transport = TcpTransport::new(endpoint, SHORT, SHORT);
        let mut payload = Cursor::new(b"ping".to_vec());
        let channel = transport.deliver(&mut payload).unwrap();
        assert_eq!(channel.response(), b"ACK:ping");
        assert_eq!(channel.peer(), format!("tcp://{endpoint}"));

        let mut probe = channel.liveness_probe();
        assert!(probe());
        handle.join().unwrap();
        assert!(!probe(), "server is gone, probe must fail");

        let names: Vec<String> = channel
            .evidence_entries()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["transcript.txt", "response.bin"]);
    }

    #[test]
    fn tcp_transport_reports_connect_failure() {
        let endpoint = free_port();
        let mut transport = TcpTransport::new(endpoint, SHORT, SHORT);
        let mut payload = Cursor::new(b"ping".to_vec());
        match transport.deliver(&mut payload) {
            Err(TransportError::Connect { endpoint: e, .. }) => assert_eq!(e, endpoint),
            Err(other) => panic!("expected connect error, got {other:?}"),
            Ok(_) => panic!("expected connect error, got a channel"),
        }
    }

    #[test]
    fn endless_reply_is_cut_off_at_the_deadline() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = server.local_addr().unwrap();
        let flood = thread::spawn(move || {
            let (mut conn, _) = server.accept().unwrap();
            let chunk = [b'y'; 1024];
            while conn.write_all(&chunk).is_ok() {
                thread::sleep(Duration::from_millis(20));
            }
        });

        let mut transport = TcpTransport::new(endpoint, SHORT, SHORT);
        let started = Instant::now();
        let channel = transport
            .deliver(&mut Cursor::new(b"ping".to_vec()))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!channel.response().is_empty());
        assert!(channel.response().len() <= MAX_RESPONSE_LEN);

        // Our side is closed, so the flood ends with a write error.
        drop(channel);
        flood.join().unwrap();
    }

    #[test]
    fn listener_transport_serves_a_live_agent() {
        let mut transport =
            ListenerTransport::new("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), SHORT);
        let addr = transport.local_addr().unwrap();

        let agent = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            let mut payload = Vec::new();
            conn.read_to_end(&mut payload).unwrap();
            conn.write_all(&[payload.len() as u8]).unwrap();
            thread::sleep(Duration::from_secs(1));
            payload
        });

        let mut payload = Cursor::new(b"fuzz!".to_vec());
        let channel = transport.deliver(&mut payload).unwrap();
        assert_eq!(channel.response(), &[5u8]);
        assert!(channel.peer().starts_with("agent://127.0.0.1:"));
        assert!(channel.liveness_probe()());

        assert_eq!(agent.join().unwrap(), b"fuzz!");
    }

    #[test]
    fn listener_transport_detects_agent_hang_up() {
        let mut transport =
            ListenerTransport::new("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5), SHORT);
        let addr = transport.local_addr().unwrap();

        let agent = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            let mut payload = Vec::new();
            conn.read_to_end(&mut payload).unwrap();
        });

        let mut payload = Cursor::new(b"boom".to_vec());
        let channel = transport.deliver(&mut payload).unwrap();
        agent.join().unwrap();
        assert!(channel.response().is_empty());
        assert!(!channel.liveness_probe()());
    }

    #[test]
    fn listener_transport_times_out_without_agent() {
        let mut transport = ListenerTransport::new(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(50),
            SHORT,
        );
        let mut payload = Cursor::new(Vec::new());
        assert!(matches!(
            transport.deliver(&mut payload),
            Err(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn listener_rebinds_after_endpoint_change() {
        let mut transport = ListenerTransport::new("127.0.0.1:0".parse().unwrap(), SHORT, SHORT);
        let first = transport.local_addr().unwrap();
        let target = free_port();
        transport.set_endpoint(target);
        let second = transport.local_addr().unwrap();
        assert_ne!(first, second);
        assert_eq!(second, target);
    }
}
