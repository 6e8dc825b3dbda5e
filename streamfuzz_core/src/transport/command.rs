use super::{Channel, LivenessProbe, Transport, TransportError};
use crate::evidence::EvidenceEntry;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a pipe may stay open after its process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Starts the child in a process group of its own, so a timeout can take down
/// everything it spawned.
pub(crate) fn isolate(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

fn kill_group(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        let group = child.id() as libc::pid_t;
        // SAFETY: killpg only takes plain integers; `group` was created by `isolate`.
        if unsafe { libc::killpg(group, libc::SIGKILL) } == 0 {
            return Ok(());
        }
        log::debug!(
            "Could not kill process group {group}: {}",
            io::Error::last_os_error()
        );
    }
    child.kill()
}

/// Waits for `child` to exit. Returns `Ok(None)` if it ran past `timeout`, in
/// which case it has been killed and reaped.
pub(crate) fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let start_time = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start_time.elapsed() > timeout {
            log::debug!("Process {} timed out, killing", child.id());
            kill_group(child)?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    }
}

/// A child pipe being read on a helper thread, so the child never blocks on a full pipe.
pub(crate) struct PipeDrain {
    buffer: Arc<Mutex<Vec<u8>>>,
    closed: Receiver<()>,
}

pub(crate) fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> PipeDrain {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, closed) = mpsc::channel();
    let sink = Arc::clone(&buffer);
    thread::spawn(move || {
        if let Some(mut pipe) = pipe {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        let _ = tx.send(());
    });
    PipeDrain { buffer, closed }
}

impl PipeDrain {
    /// Call once the process has exited. Whatever still holds the pipe open after
    /// [`DRAIN_GRACE`] (a background grandchild, say) is left behind, and only the
    /// output read so far is returned.
    pub(crate) fn finish(self) -> Vec<u8> {
        if self.closed.recv_timeout(DRAIN_GRACE).is_err() {
            log::debug!("Pipe still open {DRAIN_GRACE:?} after exit, keeping partial output");
        }
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

pub enum InputDelivery {
    StdIn,
    /// Writes the payload to a temporary file; every `{}` in the template is
    /// replaced with its path and the result is split into arguments.
    File(String),
}

pub struct CommandTransportConfig {
    pub command: Vec<String>,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
}

/// Runs the target once per delivery, feeding it the payload.
pub struct CommandTransport {
    config: CommandTransportConfig,
}

impl CommandTransport {
    pub fn new(config: CommandTransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for CommandTransport {
    fn name(&self) -> &'static str {
        "CommandTransport"
    }

    fn deliver(&mut self, payload: &mut dyn Read) -> Result<Box<dyn Channel>, TransportError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| TransportError::Config("empty target command".to_string()))?;

        let mut data = Vec::new();
        payload.read_to_end(&mut data)?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(cwd) = &self.config.working_dir {
            cmd.current_dir(cwd);
        }

        // Held until the child is done with it.
        let mut temp_file_handle: Option<tempfile::NamedTempFile> = None;
        match &self.config.input_delivery {
            InputDelivery::StdIn => {
                cmd.stdin(Stdio::piped());
            }
            InputDelivery::File(arg_template) => {
                let mut named_temp_file = tempfile::NamedTempFile::new()?;
                named_temp_file.write_all(&data)?;
                named_temp_file.flush()?;

                let path_str = named_temp_file.path().to_string_lossy().into_owned();
                let final_arg = arg_template.replace("{}", &path_str);
                for part in final_arg.split_whitespace() {
                    cmd.arg(part);
                }
                cmd.stdin(Stdio::null());
                temp_file_handle = Some(named_temp_file);
            }
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        isolate(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        // Detached: the write ends with the child's stdin, or with the payload.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                // The target may exit without reading everything.
                if let Err(e) = stdin.write_all(&data) {
                    log::debug!("Target closed stdin early: {e}");
                }
            });
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let waited = wait_with_timeout(&mut child, self.config.timeout);
        let stdout = stdout.finish();
        let stderr = stderr.finish();
        drop(temp_file_handle);

        let status = waited?.ok_or(TransportError::Timeout(self.config.timeout))?;
        Ok(Box::new(CommandChannel {
            command: self.config.command.join(" "),
            exit: ExitInfo::from(status),
            stdout,
            stderr,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("Exited with code {code}"),
            (None, Some(signal)) => format!("Terminated by signal {signal}"),
            (None, None) => "Exited abnormally".to_string(),
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Outcome of a [`CommandTransport`] run. Any unsuccessful exit reads as dead.
#[derive(Debug)]
pub struct CommandChannel {
    command: String,
    exit: ExitInfo,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandChannel {
    pub fn exit(&self) -> ExitInfo {
        self.exit
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }
}

impl Channel for CommandChannel {
    fn peer(&self) -> String {
        format!("exec://{}", self.command)
    }

    fn response(&self) -> &[u8] {
        &self.stdout
    }

    fn liveness_probe(&self) -> LivenessProbe {
        let alive = self.exit.success();
        Box::new(move || alive)
    }

    fn evidence_entries(&self) -> Vec<EvidenceEntry> {
        vec![
            EvidenceEntry::new(
                "exit.txt",
                format!("command: {}\n{}\n", self.command, self.exit.describe()).into_bytes(),
            ),
            EvidenceEntry::new("stdout.bin", self.stdout.clone()),
            EvidenceEntry::new("stderr.txt", self.stderr.clone()),
        ]
    }
}
