//! The fuzzer server: owns the registered inputs and mutation configs, drives
//! test iterations on a worker thread and reports what happened to subscribers.

use crate::detector::{CrashDetector, CrashVerdict, DetectorError};
use crate::input::{FuzzingInput, InputError};
use crate::mutation::{ConfigError, FuzzingConfig};
use crate::random::RandomByteSource;
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LISTEN_PORT: u16 = 7777;

#[derive(Error, Debug)]
pub enum FuzzerError {
    #[error("Cannot move the fuzzer from {from} to {to}")]
    InvalidTransition { from: FuzzerState, to: FuzzerState },

    #[error("The listen endpoint cannot change while the fuzzer is running")]
    ListenWhileRunning,

    #[error("No selectable inputs are registered")]
    NoInputs,

    #[error("Input #{0} does not exist or is not selectable")]
    InvalidSelection(usize),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Failed to spawn the fuzzer worker: {0}")]
    Worker(#[source] io::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FuzzerState {
    #[default]
    Stopped,
    Started,
    Paused,
}

impl fmt::Display for FuzzerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FuzzerState::Stopped => "Stopped",
            FuzzerState::Started => "Started",
            FuzzerState::Paused => "Paused",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Crash,
}

/// How the next input is chosen among the selectable ones.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    Random,
    /// Always the input at this position of the input list.
    Fixed(usize),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    pub tests: u64,
    pub crashes: u64,
    pub fails: u64,
}

#[derive(Debug, Default)]
struct Counters {
    tests: AtomicU64,
    crashes: AtomicU64,
    fails: AtomicU64,
}

impl Counters {
    fn record(&self, result: TestResult) {
        self.tests.fetch_add(1, Ordering::Relaxed);
        match result {
            TestResult::Pass => {}
            TestResult::Fail => {
                self.fails.fetch_add(1, Ordering::Relaxed);
            }
            TestResult::Crash => {
                self.crashes.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> RunStats {
        RunStats {
            tests: self.tests.load(Ordering::Relaxed),
            crashes: self.crashes.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
        }
    }
}

/// A registered input or config together with its own test counters.
#[derive(Debug)]
pub struct FuzzerStat<T: ?Sized> {
    id: u64,
    source: Option<PathBuf>,
    item: Arc<T>,
    counters: Counters,
}

impl<T: ?Sized> FuzzerStat<T> {
    fn new(id: u64, item: Arc<T>, source: Option<PathBuf>) -> Self {
        Self {
            id,
            source,
            item,
            counters: Counters::default(),
        }
    }

    /// Registration number, unique for the lifetime of the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// File the item was imported from.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn item(&self) -> &Arc<T> {
        &self.item
    }

    pub fn stats(&self) -> RunStats {
        self.counters.snapshot()
    }
}

/// A persisted crash record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzerLog {
    pub timestamp: DateTime<Local>,
    pub test_number: u64,
    pub input: String,
    pub config: Option<String>,
    #[serde(default)]
    pub config_id: Option<u64>,
    #[serde(default)]
    pub config_source: Option<PathBuf>,
    pub sample_id: String,
    pub description: String,
    /// Empty when the crash archive could not be written.
    pub evidence_path: PathBuf,
    pub evidence_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FuzzerEvent {
    StateChanged(FuzzerState),
    InputsChanged,
    ConfigurationsChanged,
    ListenChanged(SocketAddr),
    TestEnded(TestReport),
    CrashLogged(FuzzerLog),
}

/// Summary of one test iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    pub test_number: u64,
    pub sample_id: String,
    pub input: String,
    pub config: Option<String>,
    pub config_id: Option<u64>,
    pub result: TestResult,
}

#[derive(Debug)]
struct RunControl {
    state: FuzzerState,
    worker_running: bool,
    idle_delay: Duration,
}

struct Engine {
    transport: Box<dyn Transport>,
    detector: Box<dyn CrashDetector>,
    rng: RandomByteSource,
    selection: SelectionPolicy,
    cursor: usize,
    test_number: u64,
}

type InputEntry = Arc<FuzzerStat<dyn FuzzingInput>>;
type ConfigEntry = Arc<FuzzerStat<FuzzingConfig>>;

// Lock order: control, then engine.
struct Shared {
    control: Mutex<RunControl>,
    resume: Condvar,
    engine: Mutex<Engine>,
    inputs: RwLock<Vec<InputEntry>>,
    configurations: RwLock<Vec<ConfigEntry>>,
    logs: Mutex<Vec<FuzzerLog>>,
    listen: Mutex<SocketAddr>,
    subscribers: Mutex<Vec<Sender<FuzzerEvent>>>,
    totals: Counters,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, event: FuzzerEvent) {
        lock(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn register<T: ?Sized>(&self, item: Arc<T>, source: Option<PathBuf>) -> Arc<FuzzerStat<T>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(FuzzerStat::new(id, item, source))
    }

    fn select_input(&self, engine: &mut Engine) -> Result<InputEntry, FuzzerError> {
        let inputs = read(&self.inputs);
        if let SelectionPolicy::Fixed(index) = engine.selection {
            return inputs
                .get(index)
                .filter(|entry| entry.item.is_selectable())
                .map(Arc::clone)
                .ok_or(FuzzerError::InvalidSelection(index));
        }

        let selectable: Vec<&InputEntry> = inputs
            .iter()
            .filter(|entry| entry.item.is_selectable())
            .collect();
        if selectable.is_empty() {
            return Err(FuzzerError::NoInputs);
        }
        let index = match engine.selection {
            SelectionPolicy::Random => engine.rng.next(0, selectable.len() - 1),
            _ => {
                let index = engine.cursor % selectable.len();
                engine.cursor = engine.cursor.wrapping_add(1);
                index
            }
        };
        Ok(Arc::clone(selectable[index]))
    }

    fn select_config(&self, engine: &mut Engine) -> Option<ConfigEntry> {
        let configurations = read(&self.configurations);
        if configurations.is_empty() {
            return None;
        }
        let index = engine.rng.next(0, configurations.len() - 1);
        Some(Arc::clone(&configurations[index]))
    }

    fn execute(
        engine: &mut Engine,
        input: &dyn FuzzingInput,
        config: Option<&ConfigEntry>,
        sample_id: &str,
        mut rng: RandomByteSource,
    ) -> Result<CrashVerdict, FuzzerError> {
        let seed = input.open(&mut rng)?;
        let (_, stream_rng) = rng.fork();
        let mut payload: Box<dyn Read + Send> = match config {
            Some(config) => Box::new(config.item.create_stream(seed, sample_id, stream_rng)),
            None => seed,
        };

        let channel = engine.transport.deliver(&mut payload)?;
        let mut probe = channel.liveness_probe();
        Ok(engine.detector.is_crashed(channel.as_ref(), &mut probe)?)
    }

    fn run_iteration(&self) -> Result<TestReport, FuzzerError> {
        let mut engine = lock(&self.engine);
        let input = self.select_input(&mut engine)?;
        let config = self.select_config(&mut engine);

        // Everything random in this iteration derives from the sample id.
        let (seed, iteration_rng) = engine.rng.fork();
        let sample_id = format!("{seed:016x}");
        engine.test_number += 1;
        let test_number = engine.test_number;

        let input_name = input.item.to_string();
        let config_name = config.as_ref().map(|c| c.item.description().to_string());
        let config_id = config.as_ref().map(|c| c.id);
        log::debug!(
            "Test #{test_number} [{sample_id}]: {input_name} with {}",
            config_name.as_deref().unwrap_or("no mutation")
        );

        let outcome = Self::execute(
            &mut engine,
            input.item.as_ref(),
            config.as_ref(),
            &sample_id,
            iteration_rng,
        );
        drop(engine);

        let (result, crash) = match outcome {
            Ok(CrashVerdict::Alive) => (TestResult::Pass, None),
            Ok(CrashVerdict::Crashed(evidence)) => {
                let hash = evidence.hash();
                (
                    TestResult::Crash,
                    Some((evidence.description, evidence.path, hash)),
                )
            }
            Err(FuzzerError::Detector(DetectorError::Evidence {
                description,
                source,
            })) => {
                log::error!("Test #{test_number} [{sample_id}] lost its crash evidence: {source}");
                (
                    TestResult::Crash,
                    Some((
                        format!("{description} (evidence not saved: {source})"),
                        PathBuf::new(),
                        String::new(),
                    )),
                )
            }
            Err(e) => {
                log::warn!("Test #{test_number} [{sample_id}] inconclusive: {e}");
                (TestResult::Fail, None)
            }
        };

        input.counters.record(result);
        if let Some(config) = &config {
            config.counters.record(result);
        }
        self.totals.record(result);

        if let Some((description, evidence_path, evidence_hash)) = crash {
            let entry = FuzzerLog {
                timestamp: Local::now(),
                test_number,
                input: input_name.clone(),
                config: config_name.clone(),
                config_id,
                config_source: config.as_ref().and_then(|c| c.source.clone()),
                sample_id: sample_id.clone(),
                description,
                evidence_path,
                evidence_hash,
            };
            log::error!(
                "Crash on test #{test_number} [{sample_id}], evidence at {}",
                entry.evidence_path.display()
            );
            lock(&self.logs).push(entry.clone());
            self.emit(FuzzerEvent::CrashLogged(entry));
        }

        let report = TestReport {
            test_number,
            sample_id,
            input: input_name,
            config: config_name,
            config_id,
            result,
        };
        self.emit(FuzzerEvent::TestEnded(report.clone()));
        Ok(report)
    }
}

fn worker_loop(shared: Arc<Shared>) {
    log::info!("Fuzzer worker started");
    loop {
        let idle_delay = {
            let mut control = lock(&shared.control);
            while control.state == FuzzerState::Paused {
                control = shared
                    .resume
                    .wait(control)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if control.state == FuzzerState::Stopped {
                control.worker_running = false;
                break;
            }
            control.idle_delay
        };

        let idle = match shared.run_iteration() {
            Ok(_) => false,
            Err(FuzzerError::NoInputs) => {
                log::debug!("Nothing to fuzz, waiting for inputs");
                true
            }
            Err(e) => {
                // Only selection errors get here; retrying cannot fix them.
                log::error!("Iteration failed, stopping the fuzzer: {e}");
                {
                    let mut control = lock(&shared.control);
                    control.state = FuzzerState::Stopped;
                    control.worker_running = false;
                }
                shared.emit(FuzzerEvent::StateChanged(FuzzerState::Stopped));
                break;
            }
        };
        if idle {
            let control = lock(&shared.control);
            if control.state == FuzzerState::Started {
                let _ = shared.resume.wait_timeout(control, idle_delay);
            }
        }
    }
    log::info!("Fuzzer worker stopped");
}

pub struct FuzzerServer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FuzzerServer {
    pub fn new(
        transport: Box<dyn Transport>,
        detector: Box<dyn CrashDetector>,
        rng: RandomByteSource,
    ) -> Self {
        log::debug!(
            "Fuzzer created with {} and {}",
            transport.name(),
            detector.name()
        );
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(RunControl {
                    state: FuzzerState::Stopped,
                    worker_running: false,
                    idle_delay: Duration::from_millis(100),
                }),
                resume: Condvar::new(),
                engine: Mutex::new(Engine {
                    transport,
                    detector,
                    rng,
                    selection: SelectionPolicy::default(),
                    cursor: 0,
                    test_number: 0,
                }),
                inputs: RwLock::new(Vec::new()),
                configurations: RwLock::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
                listen: Mutex::new(SocketAddr::from((
                    Ipv4Addr::UNSPECIFIED,
                    DEFAULT_LISTEN_PORT,
                ))),
                subscribers: Mutex::new(Vec::new()),
                totals: Counters::default(),
                next_id: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Registers a new event subscriber. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<FuzzerEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    pub fn state(&self) -> FuzzerState {
        lock(&self.shared.control).state
    }

    /// Starts (or resumes) fuzzing on the worker thread.
    pub fn start(&self) -> Result<FuzzerState, FuzzerError> {
        {
            let mut control = lock(&self.shared.control);
            if !control.worker_running {
                let mut worker = lock(&self.worker);
                if let Some(finished) = worker.take() {
                    let _ = finished.join();
                }
                let shared = Arc::clone(&self.shared);
                let handle = thread::Builder::new()
                    .name("fuzzer-loop".to_string())
                    .spawn(move || worker_loop(shared))
                    .map_err(FuzzerError::Worker)?;
                *worker = Some(handle);
                control.worker_running = true;
            }
            control.state = FuzzerState::Started;
        }
        self.shared.resume.notify_all();
        self.transitioned(FuzzerState::Started)
    }

    /// Holds the worker at the next iteration boundary.
    pub fn pause(&self) -> Result<FuzzerState, FuzzerError> {
        {
            let mut control = lock(&self.shared.control);
            if control.state == FuzzerState::Stopped {
                return Err(FuzzerError::InvalidTransition {
                    from: FuzzerState::Stopped,
                    to: FuzzerState::Paused,
                });
            }
            control.state = FuzzerState::Paused;
        }
        self.transitioned(FuzzerState::Paused)
    }

    /// Asks the worker to exit after the iteration in flight. Does not wait for it;
    /// see [`FuzzerServer::shutdown`].
    pub fn stop(&self) -> Result<FuzzerState, FuzzerError> {
        lock(&self.shared.control).state = FuzzerState::Stopped;
        self.shared.resume.notify_all();
        self.transitioned(FuzzerState::Stopped)
    }

    /// Stops and waits for the worker thread to finish.
    pub fn shutdown(&self) {
        let _ = self.stop();
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Fuzzer worker panicked");
            }
        }
    }

    fn transitioned(&self, state: FuzzerState) -> Result<FuzzerState, FuzzerError> {
        log::info!("Fuzzer {state}");
        self.shared.emit(FuzzerEvent::StateChanged(state));
        Ok(state)
    }

    /// Runs one test iteration on the calling thread.
    pub fn run_iteration(&self) -> Result<TestReport, FuzzerError> {
        self.shared.run_iteration()
    }

    pub fn listen(&self) -> SocketAddr {
        *lock(&self.shared.listen)
    }

    /// Moves the listen endpoint. Refused while the fuzzer is running.
    pub fn set_listen(&self, endpoint: SocketAddr) -> Result<(), FuzzerError> {
        {
            let control = lock(&self.shared.control);
            if control.state == FuzzerState::Started {
                return Err(FuzzerError::ListenWhileRunning);
            }
            lock(&self.shared.engine).transport.set_endpoint(endpoint);
            *lock(&self.shared.listen) = endpoint;
        }
        log::info!("Listening on {endpoint}");
        self.shared.emit(FuzzerEvent::ListenChanged(endpoint));
        Ok(())
    }

    /// Changes how inputs are picked. A fixed selection must name a registered,
    /// selectable input.
    pub fn set_selection(&self, selection: SelectionPolicy) -> Result<(), FuzzerError> {
        if let SelectionPolicy::Fixed(index) = selection {
            let valid = read(&self.shared.inputs)
                .get(index)
                .is_some_and(|entry| entry.item.is_selectable());
            if !valid {
                return Err(FuzzerError::InvalidSelection(index));
            }
        }
        lock(&self.shared.engine).selection = selection;
        Ok(())
    }

    /// How long the worker waits before retrying when there is nothing to fuzz.
    pub fn set_idle_delay(&self, delay: Duration) {
        lock(&self.shared.control).idle_delay = delay;
    }

    pub fn add_input(&self, input: Arc<dyn FuzzingInput>) {
        log::debug!("Adding {} input {input}", input.kind());
        let entry = self.shared.register(input, None);
        write(&self.shared.inputs).push(entry);
        self.shared.emit(FuzzerEvent::InputsChanged);
    }

    pub fn remove_input(&self, index: usize) -> Option<Arc<dyn FuzzingInput>> {
        let removed = {
            let mut inputs = write(&self.shared.inputs);
            (index < inputs.len()).then(|| inputs.remove(index))
        }?;
        self.shared.emit(FuzzerEvent::InputsChanged);
        Some(Arc::clone(&removed.item))
    }

    pub fn inputs(&self) -> Vec<Arc<FuzzerStat<dyn FuzzingInput>>> {
        read(&self.shared.inputs).clone()
    }

    pub fn add_config(&self, config: FuzzingConfig) {
        self.register_config(config, None);
    }

    fn register_config(&self, config: FuzzingConfig, source: Option<PathBuf>) {
        log::debug!("Adding {} config '{config}'", config.kind());
        let entry = self.shared.register(Arc::new(config), source);
        write(&self.shared.configurations).push(entry);
        self.shared.emit(FuzzerEvent::ConfigurationsChanged);
    }

    /// Loads and registers a config file. Unreadable, malformed or unrecognized
    /// files are skipped; the return value tells whether anything was added.
    pub fn add_config_file(&self, path: &Path) -> bool {
        match FuzzingConfig::load(path) {
            Ok(config) => {
                self.register_config(config, Some(path.to_path_buf()));
                true
            }
            Err(ConfigError::UnknownExtension(_)) => {
                log::debug!("Ignoring {path:?}: not a mutation config");
                false
            }
            Err(e) => {
                log::warn!("Skipping {path:?}: {e}");
                false
            }
        }
    }

    /// Registers every config file found directly inside `dir`, in name order.
    pub fn add_config_dir(&self, dir: &Path) -> usize {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read config directory {dir:?}: {e}");
                return 0;
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        paths
            .iter()
            .filter(|path| self.add_config_file(path))
            .count()
    }

    pub fn remove_config(&self, index: usize) -> Option<Arc<FuzzingConfig>> {
        let removed = {
            let mut configurations = write(&self.shared.configurations);
            (index < configurations.len()).then(|| configurations.remove(index))
        }?;
        self.shared.emit(FuzzerEvent::ConfigurationsChanged);
        Some(Arc::clone(&removed.item))
    }

    pub fn configurations(&self) -> Vec<Arc<FuzzerStat<FuzzingConfig>>> {
        read(&self.shared.configurations).clone()
    }

    pub fn logs(&self) -> Vec<FuzzerLog> {
        lock(&self.shared.logs).clone()
    }

    pub fn clear_logs(&self) {
        lock(&self.shared.logs).clear();
    }

    pub fn stats(&self) -> RunStats {
        self.shared.totals.snapshot()
    }
}

impl Drop for FuzzerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
