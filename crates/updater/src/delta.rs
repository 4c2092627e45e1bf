//! Binary delta between two versions of one file.
//!
//! The differ indexes the old file by seed fingerprints at a fixed stride,
//! rolls a fingerprint across every offset of the new file and greedily
//! extends each verified seed match in both directions. Output is a list of
//! COPY (from old) and ADD (literal) commands.
//!
//! Wire format:
//!   header: magic `UPD\x01` (4 bytes) + new file size (u64 BE)
//!   COPY:   type=1, offset:u64, len:u64
//!   ADD:    type=2, len:u64, data
//!   END:    type=0

use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DELTA_MAGIC: &[u8; 4] = b"UPD\x01";
pub const SEED_LEN: usize = 16;
const HASH_BASE: u64 = 263;
const HEADER_SIZE: usize = 12;
const CMD_END: u8 = 0;
const CMD_COPY: u8 = 1;
const CMD_ADD: u8 = 2;

/// Why a delta could not be decoded or applied.
#[derive(thiserror::Error, Debug)]
pub enum DeltaError {
    /// Bad magic or an unknown command byte.
    #[error("invalid delta format: {0}")]
    InvalidFormat(String),
    /// The delta ends in the middle of a command.
    #[error("unexpected end of delta data")]
    UnexpectedEof,
    /// A copy reads past the end of the old file.
    #[error("copy of {length} bytes at {offset} exceeds the {size} byte source")]
    OutOfBounds { offset: u64, length: u64, size: u64 },
    /// The rebuilt file has a different length than the header declares.
    #[error("delta produced {actual} bytes, header declares {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    /// Reading either input file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Copy { offset: usize, length: usize },
    Add { data: Vec<u8> },
}

/// Byte counts of an encoded delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    pub copy_bytes: usize,
    pub add_bytes: usize,
    pub encoded_bytes: usize,
}

/// Karp-Rabin fingerprint over a fixed window, wrapping arithmetic.
struct RollingHash {
    value: u64,
    high_power: u64,
}

impl RollingHash {
    fn new(window: &[u8]) -> Self {
        let mut value = 0u64;
        let mut high_power = 1u64;
        for (i, &byte) in window.iter().enumerate() {
            value = value.wrapping_mul(HASH_BASE).wrapping_add(byte as u64);
            if i + 1 < window.len() {
                high_power = high_power.wrapping_mul(HASH_BASE);
            }
        }
        Self { value, high_power }
    }

    fn roll(&mut self, outgoing: u8, incoming: u8) {
        self.value = self
            .value
            .wrapping_sub((outgoing as u64).wrapping_mul(self.high_power))
            .wrapping_mul(HASH_BASE)
            .wrapping_add(incoming as u64);
    }
}

fn fingerprint(window: &[u8]) -> u64 {
    RollingHash::new(window).value
}

/// Compute commands that rebuild `new` from `old`.
pub fn diff(old: &[u8], new: &[u8]) -> Vec<Command> {
    let mut commands = Vec::new();
    if new.is_empty() {
        return commands;
    }

    // Seeds of the old file at a stride of SEED_LEN; first occurrence wins.
    let mut index: HashMap<u64, usize> = HashMap::new();
    if old.len() >= SEED_LEN {
        let mut offset = 0;
        while offset + SEED_LEN <= old.len() {
            index
                .entry(fingerprint(&old[offset..offset + SEED_LEN]))
                .or_insert(offset);
            offset += SEED_LEN;
        }
    }

    let mut pending = 0usize;
    let mut cursor = 0usize;
    let mut rolling: Option<RollingHash> = None;

    while cursor + SEED_LEN <= new.len() {
        let hash = rolling.get_or_insert_with(|| RollingHash::new(&new[cursor..cursor + SEED_LEN]));

        let candidate = index
            .get(&hash.value)
            .copied()
            .filter(|&o| old[o..o + SEED_LEN] == new[cursor..cursor + SEED_LEN]);

        let Some(old_start) = candidate else {
            if cursor + SEED_LEN < new.len() {
                hash.roll(new[cursor], new[cursor + SEED_LEN]);
            }
            cursor += 1;
            continue;
        };

        // Extend backwards into the pending literal run, then forwards.
        let mut back = 0;
        while back < old_start
            && back < cursor - pending
            && old[old_start - back - 1] == new[cursor - back - 1]
        {
            back += 1;
        }
        let mut length = SEED_LEN;
        while cursor + length < new.len()
            && old_start + length < old.len()
            && new[cursor + length] == old[old_start + length]
        {
            length += 1;
        }

        let match_start = cursor - back;
        if pending < match_start {
            commands.push(Command::Add {
                data: new[pending..match_start].to_vec(),
            });
        }
        commands.push(Command::Copy {
            offset: old_start - back,
            length: length + back,
        });
        cursor += length;
        pending = cursor;
        rolling = None;
    }

    if pending < new.len() {
        commands.push(Command::Add {
            data: new[pending..].to_vec(),
        });
    }
    commands
}

/// Serialize `commands` behind the `UPD\x01` header declaring `new_size`.
pub fn encode(commands: &[Command], new_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + 1);
    out.extend_from_slice(DELTA_MAGIC);
    out.extend_from_slice(&(new_size as u64).to_be_bytes());
    for cmd in commands {
        match cmd {
            Command::Copy { offset, length } => {
                out.push(CMD_COPY);
                out.extend_from_slice(&(*offset as u64).to_be_bytes());
                out.extend_from_slice(&(*length as u64).to_be_bytes());
            }
            Command::Add { data } => {
                out.push(CMD_ADD);
                out.extend_from_slice(&(data.len() as u64).to_be_bytes());
                out.extend_from_slice(data);
            }
        }
    }
    out.push(CMD_END);
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DeltaError> {
        let end = self.pos.checked_add(len).ok_or(DeltaError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(DeltaError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DeltaError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, DeltaError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }
}

/// Rebuild the new file from `old` and an encoded delta.
pub fn apply(old: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    if delta.len() < HEADER_SIZE || &delta[..4] != DELTA_MAGIC {
        return Err(DeltaError::InvalidFormat("not a delta file".into()));
    }
    let mut reader = Reader { data: delta, pos: 4 };
    let expected = reader.u64()?;
    let mut out = Vec::with_capacity(usize::try_from(expected).unwrap_or(0).min(1 << 30));

    loop {
        match reader.u8()? {
            CMD_END => break,
            CMD_COPY => {
                let offset = reader.u64()?;
                let length = reader.u64()?;
                let end = offset.checked_add(length);
                match end {
                    Some(end) if end <= old.len() as u64 => {
                        out.extend_from_slice(&old[offset as usize..end as usize]);
                    }
                    _ => {
                        return Err(DeltaError::OutOfBounds {
                            offset,
                            length,
                            size: old.len() as u64,
                        })
                    }
                }
            }
            CMD_ADD => {
                let length = reader.u64()?;
                let length = usize::try_from(length).map_err(|_| DeltaError::UnexpectedEof)?;
                out.extend_from_slice(reader.take(length)?);
            }
            other => {
                return Err(DeltaError::InvalidFormat(format!(
                    "unknown command type: {other}"
                )))
            }
        }
    }

    if out.len() as u64 != expected {
        return Err(DeltaError::SizeMismatch {
            expected,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Diff two files and write the encoded delta to `delta_path`.
pub fn diff_files(old_path: &Path, new_path: &Path, delta_path: &Path) -> Result<DeltaStats, DeltaError> {
    let old = fs::read(old_path)?;
    let new = fs::read(new_path)?;
    let commands = diff(&old, &new);
    let encoded = encode(&commands, new.len());
    fs::write(delta_path, &encoded)?;

    let mut stats = DeltaStats {
        encoded_bytes: encoded.len(),
        ..DeltaStats::default()
    };
    for cmd in &commands {
        match cmd {
            Command::Copy { length, .. } => stats.copy_bytes += length,
            Command::Add { data } => stats.add_bytes += data.len(),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn rebuilds_edited_binary_with_mostly_copies() {
        let old = pseudo_random(64 * 1024, 7);
        let mut new = old.clone();
        new[1000..1010].copy_from_slice(b"0123456789");
        new.splice(30_000..30_000, b"inserted section".iter().copied());
        new.drain(50_000..50_500);

        let commands = diff(&old, &new);
        let delta = encode(&commands, new.len());
        assert_eq!(apply(&old, &delta).unwrap(), new);
        assert!(delta.len() < new.len() / 10, "delta too large: {}", delta.len());
    }

    #[test]
    fn handles_empty_and_unrelated_inputs() {
        let new = b"brand new contents".to_vec();
        let delta = encode(&diff(&[], &new), new.len());
        assert_eq!(apply(&[], &delta).unwrap(), new);

        let delta = encode(&diff(b"old contents", &[]), 0);
        assert!(apply(b"old contents", &delta).unwrap().is_empty());

        let old = pseudo_random(4096, 1);
        let other = pseudo_random(4096, 2);
        let delta = encode(&diff(&old, &other), other.len());
        assert_eq!(apply(&old, &delta).unwrap(), other);
    }

    #[test]
    fn rejects_corrupt_deltas() {
        let old = pseudo_random(1024, 3);
        let new = pseudo_random(1024, 3);
        let delta = encode(&diff(&old, &new), new.len());

        assert!(matches!(apply(&old, b"garbage"), Err(DeltaError::InvalidFormat(_))));
        assert!(matches!(
            apply(&old, &delta[..delta.len() - 3]),
            Err(DeltaError::UnexpectedEof)
        ));
        // Applying against a shorter source overruns the copy.
        assert!(matches!(
            apply(&old[..100], &delta),
            Err(DeltaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn size_mismatch_is_detected() {
        let new = b"abc".to_vec();
        let delta = encode(&diff(&[], &new), 10);
        assert!(matches!(
            apply(&[], &delta),
            Err(DeltaError::SizeMismatch { expected: 10, actual: 3 })
        ));
    }
}
