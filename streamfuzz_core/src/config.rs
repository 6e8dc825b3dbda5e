use crate::detector::{CrashDetector, KeepAliveDetector, PollingDetector};
use crate::evidence::EvidenceCollector;
use crate::fuzzer::{DEFAULT_LISTEN_PORT, FuzzerServer, SelectionPolicy};
use crate::input::{ExecutionInput, FileInput, FuzzingInput, RandomInput, TcpQueryInput};
use crate::random::RandomByteSource;
use crate::transport::{
    CommandTransport, CommandTransportConfig, InputDelivery, ListenerTransport, TcpTransport,
    Transport,
};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

impl From<&ConfigInputDelivery> for InputDelivery {
    fn from(delivery: &ConfigInputDelivery) -> Self {
        match delivery {
            ConfigInputDelivery::StdIn => InputDelivery::StdIn,
            ConfigInputDelivery::File { template } => InputDelivery::File(template.clone()),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TargetType {
    /// Wait for the target's agent to connect to the listen endpoint.
    #[default]
    Listen,
    /// Connect to a target server.
    Connect,
    /// Spawn the target once per test.
    Command,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub connect: Option<SocketAddr>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default)]
    pub command_settings: Option<CommandSettings>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target_type: TargetType::default(),
            connect: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_timeout_ms(),
            command_settings: None,
        }
    }
}

impl TargetConfig {
    pub fn build(&self, listen: SocketAddr) -> Result<Box<dyn Transport>, anyhow::Error> {
        let io_timeout = Duration::from_millis(self.io_timeout_ms);
        let connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        let transport: Box<dyn Transport> = match self.target_type {
            TargetType::Listen => {
                Box::new(ListenerTransport::new(listen, connect_timeout, io_timeout))
            }
            TargetType::Connect => {
                let endpoint = self.connect.ok_or_else(|| {
                    anyhow::anyhow!("'connect' address missing for the connect target type")
                })?;
                Box::new(TcpTransport::new(endpoint, connect_timeout, io_timeout))
            }
            TargetType::Command => {
                let settings = self.command_settings.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("Command settings missing for the command target type")
                })?;
                if settings.command.is_empty() {
                    anyhow::bail!("Target command is empty");
                }
                Box::new(CommandTransport::new(CommandTransportConfig {
                    command: settings.command.clone(),
                    input_delivery: InputDelivery::from(&settings.input_delivery),
                    timeout: Duration::from_millis(settings.timeout_ms),
                    working_dir: settings.working_dir.clone(),
                }))
            }
        };
        Ok(transport)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorType {
    #[default]
    KeepAlive,
    Polling,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DetectorConfig {
    #[serde(default)]
    pub detector_type: DetectorType,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    pub dump_dir: Option<PathBuf>,
}

fn default_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_window_ms() -> u64 {
    1000
}
fn default_interval_ms() -> u64 {
    50
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detector_type: DetectorType::default(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            window_ms: default_window_ms(),
            interval_ms: default_interval_ms(),
            dump_dir: None,
        }
    }
}

impl DetectorConfig {
    pub fn build(&self, crash_dir: &Path) -> Box<dyn CrashDetector> {
        let mut collector = EvidenceCollector::new(crash_dir);
        if let Some(dump_dir) = &self.dump_dir {
            collector = collector.with_dump_dir(dump_dir);
        }
        match self.detector_type {
            DetectorType::KeepAlive => Box::new(KeepAliveDetector::new(
                self.retries,
                Duration::from_millis(self.retry_delay_ms),
                collector,
            )),
            DetectorType::Polling => Box::new(PollingDetector::new(
                Duration::from_millis(self.window_ms),
                Duration::from_millis(self.interval_ms),
                collector,
            )),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TcpQuerySettings {
    pub endpoint: SocketAddr,
    pub request: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InputsConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Every regular file inside these directories becomes a file input.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    /// Lengths of random inputs.
    #[serde(default)]
    pub random: Vec<u64>,
    #[serde(default)]
    pub tcp_queries: Vec<TcpQuerySettings>,
    #[serde(default)]
    pub executions: Vec<ExecutionSettings>,
}

impl InputsConfig {
    pub fn build(&self) -> Result<Vec<Arc<dyn FuzzingInput>>, anyhow::Error> {
        let mut inputs: Vec<Arc<dyn FuzzingInput>> = Vec::new();
        for path in &self.files {
            inputs.push(Arc::new(FileInput::new(path)));
        }
        for dir in &self.dirs {
            let found = FileInput::from_dir(dir)
                .map_err(|e| anyhow::anyhow!("Failed to read input directory {:?}: {}", dir, e))?;
            for input in found {
                inputs.push(Arc::new(input));
            }
        }
        for length in &self.random {
            inputs.push(Arc::new(RandomInput::new(*length)));
        }
        for query in &self.tcp_queries {
            inputs.push(Arc::new(TcpQueryInput::new(
                query.endpoint,
                query.request.clone(),
                Duration::from_millis(query.timeout_ms),
            )));
        }
        for execution in &self.executions {
            inputs.push(Arc::new(ExecutionInput::new(
                execution.program.clone(),
                execution.args.clone(),
                Duration::from_millis(execution.timeout_ms),
            )));
        }
        Ok(inputs)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ConfigsConfig {
    /// Mutation config files or directories holding them.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub seed: Option<u64>,
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,
    #[serde(default = "default_idle_delay_ms")]
    pub idle_delay_ms: u64,
}

pub fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_LISTEN_PORT))
}
pub fn default_iterations() -> u64 {
    1_000_000
}
pub fn default_crash_dir() -> PathBuf {
    PathBuf::from("./.streamfuzz_crashes")
}
fn default_idle_delay_ms() -> u64 {
    100
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            seed: None,
            max_iterations: default_iterations(),
            selection: SelectionPolicy::default(),
            crash_dir: default_crash_dir(),
            idle_delay_ms: default_idle_delay_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StreamfuzzConfig {
    #[serde(default)]
    pub fuzzer: Option<FuzzerSettings>,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub detector: Option<DetectorConfig>,
    #[serde(default)]
    pub inputs: Option<InputsConfig>,
    #[serde(default)]
    pub configs: Option<ConfigsConfig>,
}

impl StreamfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Wires a fuzzer server with every input and mutation config listed here.
    pub fn build_server(&self) -> Result<FuzzerServer, anyhow::Error> {
        let settings = self.fuzzer.clone().unwrap_or_default();
        let detector = self.detector.clone().unwrap_or_default();

        let rng = match settings.seed {
            Some(seed) => RandomByteSource::from_seed(seed),
            None => RandomByteSource::from_entropy(),
        };
        let server = FuzzerServer::new(
            self.target.build(settings.listen)?,
            detector.build(&settings.crash_dir),
            rng,
        );
        server.set_listen(settings.listen)?;
        server.set_idle_delay(Duration::from_millis(settings.idle_delay_ms));

        if let Some(inputs) = &self.inputs {
            for input in inputs.build()? {
                server.add_input(input);
            }
        }
        if let Some(configs) = &self.configs {
            for path in &configs.paths {
                if path.is_dir() {
                    let added = server.add_config_dir(path);
                    log::info!("Loaded {added} mutation configs from {path:?}");
                } else if !server.add_config_file(path) {
                    log::warn!("Mutation config {path:?} was not loaded");
                }
            }
        }
        // Checked against the inputs registered above.
        server.set_selection(settings.selection)?;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{FuzzingConfig, PatchChange, PatchConfig};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StreamfuzzConfig::from_toml("").unwrap();
        assert!(config.fuzzer.is_none());
        assert_eq!(config.target.target_type, TargetType::Listen);
        assert_eq!(config.target.io_timeout_ms, 2000);

        let settings = config.fuzzer.unwrap_or_default();
        assert_eq!(settings.listen.port(), 7777);
        assert_eq!(settings.max_iterations, default_iterations());
        assert_eq!(settings.selection, SelectionPolicy::RoundRobin);
    }

    #[test]
    fn full_document_parses() {
        let config = StreamfuzzConfig::from_toml(
            r#"
            [fuzzer]
            listen = "127.0.0.1:9000"
            seed = 7
            max-iterations = 50
            selection = { fixed = 1 }
            crash-dir = "/tmp/crashes"

            [target]
            target-type = "command"

            [target.command-settings]
            command = ["./target", "--parse"]
            input-delivery = { file = { template = "--input {}" } }
            timeout-ms = 500

            [detector]
            detector-type = "polling"
            window-ms = 250
            dump-dir = "/var/crash"

            [inputs]
            files = ["seeds/a.bin"]
            random = [64, 128]
            tcp-queries = [{ endpoint = "127.0.0.1:80", request = "get.txt" }]
            executions = [{ program = "gen", args = ["--one"] }]

            [configs]
            paths = ["configs/"]
            "#,
        )
        .unwrap();

        let fuzzer = config.fuzzer.unwrap();
        assert_eq!(fuzzer.seed, Some(7));
        assert_eq!(fuzzer.max_iterations, 50);
        assert_eq!(fuzzer.selection, SelectionPolicy::Fixed(1));
        assert_eq!(fuzzer.idle_delay_ms, 100);

        let command = config.target.command_settings.unwrap();
        assert_eq!(command.command, vec!["./target", "--parse"]);
        assert_eq!(
            command.input_delivery,
            ConfigInputDelivery::File {
                template: "--input {}".to_string()
            }
        );

        let detector = config.detector.unwrap();
        assert_eq!(detector.detector_type, DetectorType::Polling);
        assert_eq!(detector.window_ms, 250);
        assert_eq!(detector.retries, 3);

        let inputs = config.inputs.unwrap();
        assert_eq!(inputs.random, vec![64, 128]);
        assert_eq!(inputs.tcp_queries[0].timeout_ms, 2000);
        assert_eq!(inputs.executions[0].args, vec!["--one"]);
        assert_eq!(config.configs.unwrap().paths.len(), 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(StreamfuzzConfig::from_toml("[fuzzer]\nthreads = 4\n").is_err());
        assert!(StreamfuzzConfig::from_toml("[target]\ntarget-type = \"ptrace\"\n").is_err());
    }

    #[test]
    fn load_from_file_reports_paths() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = StreamfuzzConfig::load_from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[fuzzer\n").unwrap();
        assert!(StreamfuzzConfig::load_from_file(&broken).is_err());
    }

    #[test]
    fn target_requires_its_settings() {
        let listen = default_listen();
        let connect = TargetConfig {
            target_type: TargetType::Connect,
            ..TargetConfig::default()
        };
        assert!(connect.build(listen).is_err());

        let command = TargetConfig {
            target_type: TargetType::Command,
            command_settings: Some(CommandSettings::default()),
            ..TargetConfig::default()
        };
        assert!(command.build(listen).is_err());

        let transport = TargetConfig::default().build(listen).unwrap();
        assert_eq!(transport.name(), "ListenerTransport");
    }

    #[test]
    fn build_server_registers_inputs_and_configs() {
        let dir = tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        fs::create_dir(&seeds).unwrap();
        fs::write(seeds.join("one.bin"), b"ABCDEFGH").unwrap();
        fs::write(seeds.join("two.bin"), b"12345678").unwrap();

        let configs = dir.path().join("configs");
        fs::create_dir(&configs).unwrap();
        let patch = FuzzingConfig::from(PatchConfig::new("p", vec![PatchChange::bytes(0, *b"Z")]));
        fs::write(configs.join("p.fpatch"), patch.to_json().unwrap()).unwrap();
        fs::write(configs.join("readme.md"), "not a config").unwrap();

        let config = StreamfuzzConfig::from_toml(&format!(
            r#"
            [fuzzer]
            seed = 1
            crash-dir = {crashes:?}

            [target]
            target-type = "command"
            command-settings = {{ command = ["sh", "-c", "cat >/dev/null"] }}

            [inputs]
            dirs = [{seeds:?}]
            random = [16]

            [configs]
            paths = [{configs:?}]
            "#,
            crashes = dir.path().join("crashes"),
            seeds = seeds,
            configs = configs,
        ))
        .unwrap();

        let server = config.build_server().unwrap();
        assert_eq!(server.inputs().len(), 3);
        assert_eq!(server.configurations().len(), 1);
        assert_eq!(server.listen(), default_listen());

        let report = server.run_iteration().unwrap();
        assert!(report.input.ends_with("one.bin"));
        assert_eq!(report.config.as_deref(), Some("p"));
    }

    #[test]
    fn build_server_rejects_a_fixed_selection_past_the_inputs() {
        let dir = tempdir().unwrap();
        let seed = dir.path().join("seed.bin");
        fs::write(&seed, b"ABCD").unwrap();
        let document = |index: usize| {
            format!(
                r#"
                [fuzzer]
                selection = {{ fixed = {index} }}

                [target]
                target-type = "command"
                command-settings = {{ command = ["sh", "-c", "cat >/dev/null"] }}

                [inputs]
                files = [{seed:?}]
                "#
            )
        };

        let config = StreamfuzzConfig::from_toml(&document(9)).unwrap();
        let error = config.build_server().err().unwrap();
        assert!(error.to_string().contains("#9"));

        let config = StreamfuzzConfig::from_toml(&document(0)).unwrap();
        let server = config.build_server().unwrap();
        assert!(server.run_iteration().unwrap().input.ends_with("seed.bin"));
    }
}
