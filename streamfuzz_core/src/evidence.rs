use chrono::{DateTime, Local};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// A named blob that ends up in a crash archive (a transcript, a stderr capture,
/// a core dump...).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub name: String,
    pub contents: Vec<u8>,
}

impl EvidenceEntry {
    pub fn new(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// The document stored (gzip-compressed) inside a crash archive.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EvidenceBundle {
    pub created: DateTime<Local>,
    pub description: String,
    pub entries: Vec<EvidenceEntry>,
}

/// Packaged proof of a crash: the archive bytes and where they were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEvidence {
    pub path: PathBuf,
    pub archive: Vec<u8>,
    pub description: String,
}

impl CrashEvidence {
    /// Hex MD5 of the archive, used to tell crash records apart.
    pub fn hash(&self) -> String {
        format!("{:x}", md5::compute(&self.archive))
    }
}

/// Turns channel transcripts and an optional crash-dump directory into a
/// [`CrashEvidence`] archive under `crash_dir`.
#[derive(Debug, Clone)]
pub struct EvidenceCollector {
    crash_dir: PathBuf,
    dump_dir: Option<PathBuf>,
}

impl EvidenceCollector {
    pub fn new(crash_dir: impl Into<PathBuf>) -> Self {
        Self {
            crash_dir: crash_dir.into(),
            dump_dir: None,
        }
    }

    /// Files found directly inside `dump_dir` are attached to every archive.
    pub fn with_dump_dir(mut self, dump_dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dump_dir.into());
        self
    }

    pub fn crash_dir(&self) -> &Path {
        &self.crash_dir
    }

    pub fn collect(
        &self,
        description: &str,
        mut entries: Vec<EvidenceEntry>,
    ) -> io::Result<CrashEvidence> {
        if let Some(dump_dir) = &self.dump_dir {
            entries.extend(read_dump_dir(dump_dir)?);
        }

        let bundle = EvidenceBundle {
            created: Local::now(),
            description: description.to_string(),
            entries,
        };
        let archive = pack(&bundle)?;

        fs::create_dir_all(&self.crash_dir)?;
        let file_name = format!(
            "crash_{}_{:x}.json.gz",
            bundle.created.format("%Y%m%d_%H%M%S%3f"),
            md5::compute(&archive)
        );
        let path = self.crash_dir.join(file_name);
        fs::write(&path, &archive)?;
        log::debug!("Wrote crash archive {path:?} ({} bytes)", archive.len());

        Ok(CrashEvidence {
            path,
            archive,
            description: bundle.description,
        })
    }
}

fn read_dump_dir(dump_dir: &Path) -> io::Result<Vec<EvidenceEntry>> {
    if !dump_dir.is_dir() {
        log::warn!("Crash dump directory {dump_dir:?} does not exist, nothing to attach");
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dump_dir)? {
        let path = entry?.path();
        if path.is_file() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(EvidenceEntry::new(format!("dump/{name}"), fs::read(&path)?));
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn pack(bundle: &EvidenceBundle) -> io::Result<Vec<u8>> {
    let json = serde_json::to_vec(bundle)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

/// Decodes an archive produced by [`EvidenceCollector::collect`].
pub fn unpack(archive: &[u8]) -> io::Result<EvidenceBundle> {
    let mut json = Vec::new();
    GzDecoder::new(archive).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn collect_writes_a_readable_archive() {
        let crash_dir = tempdir().unwrap();
        let collector = EvidenceCollector::new(crash_dir.path().join("crashes"));

        let evidence = collector
            .collect(
                "target stopped answering",
                vec![EvidenceEntry::new("response", b"partial".to_vec())],
            )
            .unwrap();

        assert!(!evidence.archive.is_empty());
        assert!(evidence.path.starts_with(crash_dir.path().join("crashes")));
        assert_eq!(fs::read(&evidence.path).unwrap(), evidence.archive);
        assert_eq!(evidence.hash().len(), 32);

        let bundle = unpack(&evidence.archive).unwrap();
        assert_eq!(bundle.description, "target stopped answering");
        assert_eq!(bundle.entries, vec![EvidenceEntry::new("response", *b"partial")]);
    }

    #[test]
    fn dump_dir_files_are_attached() {
        let crash_dir = tempdir().unwrap();
        let dump_dir = tempdir().unwrap();
        fs::write(dump_dir.path().join("core.1234"), b"\x7fELF").unwrap();
        fs::write(dump_dir.path().join("asan.log"), b"heap-buffer-overflow").unwrap();
        fs::create_dir(dump_dir.path().join("nested")).unwrap();

        let collector = EvidenceCollector::new(crash_dir.path()).with_dump_dir(dump_dir.path());
        let evidence = collector.collect("dumped", Vec::new()).unwrap();
        let names: Vec<String> = unpack(&evidence.archive)
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["dump/asan.log", "dump/core.1234"]);
    }

    #[test]
    fn missing_dump_dir_is_not_fatal() {
        let crash_dir = tempdir().unwrap();
        let collector = EvidenceCollector::new(crash_dir.path())
            .with_dump_dir(crash_dir.path().join("does-not-exist"));
        let evidence = collector.collect("no dumps", Vec::new()).unwrap();
        assert!(unpack(&evidence.archive).unwrap().entries.is_empty());
    }
}
