pub mod config;
pub mod detector;
pub mod evidence;
pub mod fuzzer;
pub mod input;
pub mod logging;
pub mod mutation;
pub mod random;
pub mod stream;
pub mod transport;

pub use config::StreamfuzzConfig;
pub use detector::{CrashDetector, CrashVerdict, DetectorError, KeepAliveDetector, PollingDetector};
pub use evidence::{CrashEvidence, EvidenceCollector, EvidenceEntry};
pub use fuzzer::{
    FuzzerError, FuzzerEvent, FuzzerLog, FuzzerServer, FuzzerStat, FuzzerState, RunStats,
    SelectionPolicy, TestReport, TestResult,
};
pub use input::{
    ExecutionInput, FileInput, FuzzingInput, InputError, InputKind, RandomInput, TcpQueryInput,
};
pub use mutation::{ConfigError, ConfigKind, FuzzingConfig, MutationConfig, PatchConfig};
pub use random::RandomByteSource;
pub use stream::FuzzingStream;
pub use transport::{Channel, Transport, TransportError};
