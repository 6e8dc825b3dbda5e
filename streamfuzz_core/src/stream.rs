use crate::mutation::FuzzingConfig;
use crate::random::RandomByteSource;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Instant;

/// A read-only view of `inner` with the bound config applied byte by byte.
///
/// Mutation happens lazily inside [`Read::read`]; nothing is buffered beyond the
/// bytes of a replacement that is still being written out. Replacements never
/// change the stream length: a multi-byte replacement overwrites the bytes after
/// its offset and is cut short at end of stream. Offsets covered by a replacement
/// in progress are not looked up again.
///
/// A stream is not meant to be shared between readers; wrap it yourself if you
/// need that.
#[derive(Debug)]
pub struct FuzzingStream<R> {
    inner: R,
    config: Arc<FuzzingConfig>,
    sample_id: String,
    rng: RandomByteSource,
    offset: u64,
    opened_at: Instant,
    pending: VecDeque<u8>,
}

impl<R: Read> FuzzingStream<R> {
    pub fn new(
        inner: R,
        config: Arc<FuzzingConfig>,
        sample_id: impl Into<String>,
        rng: RandomByteSource,
    ) -> Self {
        Self {
            inner,
            config,
            sample_id: sample_id.into(),
            rng,
            offset: 0,
            opened_at: Instant::now(),
            pending: VecDeque::new(),
        }
    }
}

impl<R> FuzzingStream<R> {
    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    /// Number of bytes of mutated content handed out so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn config(&self) -> &Arc<FuzzingConfig> {
        &self.config
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for FuzzingStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // An empty buffer yields 0 without meaning end of stream.
        if buf.is_empty() {
            return Ok(0);
        }
        let read = self.inner.read(buf)?;
        let elapsed_secs = self.opened_at.elapsed().as_secs();

        for byte in &mut buf[..read] {
            if self.pending.is_empty() {
                if let Some(change) = self.config.get(self.offset, elapsed_secs, &mut self.rng) {
                    self.pending.extend(change.materialize(&mut self.rng));
                }
            }
            if let Some(replacement) = self.pending.pop_front() {
                *byte = replacement;
            }
            self.offset += 1;
        }

        if read == 0 {
            self.pending.clear();
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{MutationConfig, MutationRule, PatchChange, PatchConfig};
    use std::io::Cursor;

    fn patch(changes: Vec<PatchChange>) -> Arc<FuzzingConfig> {
        Arc::new(PatchConfig::new("test", changes).into())
    }

    fn read_all<R: Read>(mut stream: R) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    /// Reads one byte per call to exercise offset tracking across reads.
    fn read_bytewise<R: Read>(stream: &mut R) -> Vec<u8> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).unwrap() == 1 {
            out.push(byte[0]);
        }
        out
    }

    #[test]
    fn single_patch_replaces_one_byte() {
        let config = patch(vec![PatchChange::bytes(2, *b"X")]);
        let stream = config.create_stream(
            Cursor::new(b"ABCDEFGH".to_vec()),
            "s1",
            RandomByteSource::from_seed(0),
        );
        assert_eq!(stream.sample_id(), "s1");
        assert_eq!(read_all(stream), b"ABXDEFGH");
    }

    #[test]
    fn config_without_applicable_changes_is_transparent() {
        let original: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let config = patch(vec![PatchChange::bytes(1_000_000, *b"!")]);
        let stream = config.create_stream(
            Cursor::new(original.clone()),
            "noop",
            RandomByteSource::from_seed(0),
        );
        assert_eq!(read_all(stream), original);

        let empty = patch(Vec::new());
        let stream = empty.create_stream(
            Cursor::new(original.clone()),
            "empty",
            RandomByteSource::from_seed(0),
        );
        assert_eq!(read_all(stream), original);
    }

    #[test]
    fn offsets_carry_across_small_reads() {
        let config = patch(vec![
            PatchChange::bytes(0, *b"a"),
            PatchChange::bytes(5, *b"f"),
        ]);
        let mut stream = config.create_stream(
            Cursor::new(b"ABCDEFGH".to_vec()),
            "bytewise",
            RandomByteSource::from_seed(0),
        );
        assert_eq!(read_bytewise(&mut stream), b"aBCDEfGH");
        assert_eq!(stream.offset(), 8);
    }

    #[test]
    fn multi_byte_replacement_overwrites_and_is_truncated_at_eof() {
        let config = patch(vec![
            PatchChange::bytes(1, *b"xyz"),
            PatchChange::bytes(2, *b"!"),
            PatchChange::bytes(6, *b"1234"),
        ]);
        let stream = config.create_stream(
            Cursor::new(b"ABCDEFGH".to_vec()),
            "wide",
            RandomByteSource::from_seed(0),
        );
        assert_eq!(read_all(stream), b"AxyzEF12");
    }

    #[test]
    fn empty_reads_keep_a_replacement_in_progress() {
        let config = patch(vec![PatchChange::bytes(1, *b"xyz")]);
        let mut stream = config.create_stream(
            Cursor::new(b"ABCDEFGH".to_vec()),
            "empty-read",
            RandomByteSource::from_seed(0),
        );
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"Ax");

        assert_eq!(stream.read(&mut []).unwrap(), 0);
        assert_eq!(stream.offset(), 2);
        assert_eq!(read_all(stream), b"yzEFGH");
    }

    #[test]
    fn randomized_config_preserves_length() {
        let config = Arc::new(FuzzingConfig::from(MutationConfig::new(
            "dense",
            vec![MutationRule {
                probability: 0.5,
                length_from: 1,
                length_to: 8,
                ..MutationRule::default()
            }],
        )));
        let original = vec![0u8; 10_000];
        let stream = config.create_stream(
            Cursor::new(original.clone()),
            "dense",
            RandomByteSource::from_seed(21),
        );
        let mutated = read_all(stream);
        assert_eq!(mutated.len(), original.len());
        assert_ne!(mutated, original);
    }

    #[test]
    fn same_seed_yields_same_mutation() {
        let config = Arc::new(FuzzingConfig::from(MutationConfig::new(
            "replay",
            vec![MutationRule {
                probability: 0.1,
                ..MutationRule::default()
            }],
        )));
        let seed_bytes = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let run = |seed: u64| {
            read_all(config.create_stream(
                Cursor::new(seed_bytes.clone()),
                format!("{seed:016x}"),
                RandomByteSource::from_seed(seed),
            ))
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn into_inner_returns_underlying_reader() {
        let config = patch(Vec::new());
        let mut stream = config.create_stream(
            Cursor::new(b"abc".to_vec()),
            "inner",
            RandomByteSource::from_seed(0),
        );
        let mut two = [0u8; 2];
        stream.read_exact(&mut two).unwrap();
        assert_eq!(stream.into_inner().position(), 2);
    }
}
