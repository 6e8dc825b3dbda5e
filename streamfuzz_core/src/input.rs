use crate::random::RandomByteSource;
use crate::transport::{
    MAX_RESPONSE_LEN, close_write, drain, isolate, read_until_quiet, wait_with_timeout,
};
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Input file {0:?} not found")]
    NotFound(PathBuf),

    #[error("Input I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Input process failed: {0}")]
    Process(String),

    #[error("Input source did not finish within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    File,
    Random,
    TcpQuery,
    Execution,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputKind::File => "File",
            InputKind::Random => "Random",
            InputKind::TcpQuery => "TcpQuery",
            InputKind::Execution => "Execution",
        };
        f.write_str(name)
    }
}

/// A source of seed streams. Every call to [`FuzzingInput::open`] yields a fresh
/// stream for one test iteration.
pub trait FuzzingInput: Send + Sync + fmt::Debug + fmt::Display {
    fn kind(&self) -> InputKind;

    /// Whether the fuzzer may pick this input.
    fn is_selectable(&self) -> bool {
        true
    }

    fn open(&self, rng: &mut RandomByteSource) -> Result<Box<dyn Read + Send>, InputError>;
}

fn open_file(path: &Path) -> Result<File, InputError> {
    File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => InputError::NotFound(path.to_path_buf()),
        _ => InputError::Io(e),
    })
}

/// Seed read from a file on every iteration.
#[derive(Debug, Clone)]
pub struct FileInput {
    path: PathBuf,
}

impl FileInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One input per regular file directly inside `dir`.
    pub fn from_dir(dir: &Path) -> io::Result<Vec<FileInput>> {
        let mut inputs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                inputs.push(FileInput::new(path));
            }
        }
        inputs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(inputs)
    }
}

impl FuzzingInput for FileInput {
    fn kind(&self) -> InputKind {
        InputKind::File
    }

    fn open(&self, _rng: &mut RandomByteSource) -> Result<Box<dyn Read + Send>, InputError> {
        Ok(Box::new(open_file(&self.path)?))
    }
}

impl fmt::Display for FileInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// A fixed-length stream of random bytes, generated lazily.
#[derive(Debug, Clone)]
pub struct RandomInput {
    length: u64,
}

impl RandomInput {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

impl FuzzingInput for RandomInput {
    fn kind(&self) -> InputKind {
        InputKind::Random
    }

    fn open(&self, rng: &mut RandomByteSource) -> Result<Box<dyn Read + Send>, InputError> {
        let (_, rng) = rng.fork();
        Ok(Box::new(RandomReader {
            rng,
            remaining: self.length,
        }))
    }
}

impl fmt::Display for RandomInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Random ({} bytes)", self.length)
    }
}

struct RandomReader {
    rng: RandomByteSource,
    remaining: u64,
}

impl Read for RandomReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        self.rng
            .fill(buf, 0, count, |rng| rng.next(u8::MIN, u8::MAX));
        self.remaining -= count as u64;
        Ok(count)
    }
}

/// Queries a live server and uses its answer as the seed.
///
/// The optional request file is sent as-is; with no request the connection is
/// only opened and half-closed, which suits banner-style services.
#[derive(Debug, Clone)]
pub struct TcpQueryInput {
    endpoint: SocketAddr,
    request: Option<PathBuf>,
    timeout: Duration,
}

impl TcpQueryInput {
    pub fn new(endpoint: SocketAddr, request: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            endpoint,
            request,
            timeout,
        }
    }
}

impl FuzzingInput for TcpQueryInput {
    fn kind(&self) -> InputKind {
        InputKind::TcpQuery
    }

    fn open(&self, _rng: &mut RandomByteSource) -> Result<Box<dyn Read + Send>, InputError> {
        let request = match &self.request {
            Some(path) => {
                let mut bytes = Vec::new();
                open_file(path)?.read_to_end(&mut bytes)?;
                bytes
            }
            None => Vec::new(),
        };

        let mut stream = TcpStream::connect_timeout(&self.endpoint, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.write_all(&request)?;
        close_write(&stream);
        let deadline = Instant::now() + self.timeout;
        let response = read_until_quiet(&mut stream, deadline, MAX_RESPONSE_LEN)?;
        Ok(Box::new(Cursor::new(response)))
    }
}

impl fmt::Display for TcpQueryInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request {
            Some(request) => write!(f, "tcp://{} <{}>", self.endpoint, request.display()),
            None => write!(f, "tcp://{}", self.endpoint),
        }
    }
}

/// Runs a generator program and uses its standard output as the seed.
#[derive(Debug, Clone)]
pub struct ExecutionInput {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExecutionInput {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

impl FuzzingInput for ExecutionInput {
    fn kind(&self) -> InputKind {
        InputKind::Execution
    }

    fn open(&self, _rng: &mut RandomByteSource) -> Result<Box<dyn Read + Send>, InputError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        isolate(&mut cmd);
        let mut child = cmd
            .spawn()
            .map_err(|e| InputError::Process(format!("failed to spawn {}: {e}", self.program)))?;

        let stdout = drain(child.stdout.take());
        let status = wait_with_timeout(&mut child, self.timeout)?;
        let output = stdout.finish();

        match status {
            None => Err(InputError::Timeout(self.timeout)),
            Some(status) if !status.success() => Err(InputError::Process(format!(
                "{} exited with {status}",
                self.program
            ))),
            Some(_) => Ok(Box::new(Cursor::new(output))),
        }
    }
}

impl fmt::Display for ExecutionInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
