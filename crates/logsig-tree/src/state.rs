//! Hash-chain state persisted between runs.
//!
//! The state file carries the last leaf hash of a log stream so that the
//! next block written after a restart continues the same chain:
//!
//! ```text
//! "KSISTAT10" | algorithm id (1) | hash length (1) | digest (hash length)
//! ```
//!
//! Loading never fails: a missing, short or corrupt file simply means a new
//! chain is started. Saving replaces the file atomically.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use logsig_core::{HashAlgorithm, Imprint};
use tracing::{debug, warn};

/// Magic prefix of the state file.
pub const STATE_MAGIC: &[u8; 9] = b"KSISTAT10";

const HEADER_LEN: usize = STATE_MAGIC.len() + 2;

/// Serializes a chain hash into the state file layout.
pub fn encode(imprint: &Imprint) -> Vec<u8> {
    let digest = imprint.digest();
    let mut out = Vec::with_capacity(HEADER_LEN + digest.len());
    out.extend_from_slice(STATE_MAGIC);
    out.push(imprint.algorithm().id());
    // digest lengths are at most 64 bytes
    out.push(digest.len() as u8);
    out.extend_from_slice(digest);
    out
}

/// Parses the state file layout, returning `None` for anything malformed.
pub fn decode(bytes: &[u8]) -> Option<Imprint> {
    if bytes.len() < HEADER_LEN || &bytes[..STATE_MAGIC.len()] != STATE_MAGIC {
        return None;
    }

    let id = bytes[STATE_MAGIC.len()];
    let hash_len = usize::from(bytes[STATE_MAGIC.len() + 1]);
    let algorithm = HashAlgorithm::from_id(id).ok()?;
    if algorithm.digest_len() != hash_len {
        return None;
    }

    let digest = bytes.get(HEADER_LEN..HEADER_LEN + hash_len)?;
    Imprint::new(algorithm, digest).ok()
}

/// Reads the chain hash saved for a log stream.
pub fn load(path: &Path) -> Option<Imprint> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "no chain state, starting new hash chain");
            return None;
        },
    };

    let state = decode(&bytes);
    if state.is_none() {
        warn!(path = %path.display(), len = bytes.len(), "invalid chain state, starting new hash chain");
    }
    state
}

/// Atomically replaces the state file with `imprint`.
pub fn save(path: &Path, imprint: &Imprint) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.as_file_mut().write_all(&encode(imprint))?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_state_format() {
        let imprint = HashAlgorithm::Sha256.digest(b"leaf");
        let bytes = encode(&imprint);

        assert_eq!(&bytes[..9], b"KSISTAT10");
        assert_eq!(bytes[9], 0x01);
        assert_eq!(bytes[10], 32);
        assert_eq!(&bytes[11..], imprint.digest());
    }

    #[test]
    fn mismatched_length_is_rejected() {
        let imprint = HashAlgorithm::Sha256.digest(b"leaf");
        let mut bytes = encode(&imprint);
        bytes[10] = 48;

        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let imprint = HashAlgorithm::Sha256.digest(b"leaf");
        let mut bytes = encode(&imprint);
        bytes[9] = 0x00;

        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = encode(&HashAlgorithm::Sha256.digest(b"leaf"));
        bytes[..9].copy_from_slice(b"KSISTAT11");

        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let bytes = encode(&HashAlgorithm::Sha256.digest(b"leaf"));

        for len in [0, 9, HEADER_LEN - 1] {
            assert!(decode(&bytes[..len]).is_none(), "{len} bytes decoded");
        }
    }

    #[test]
    fn load_of_missing_or_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log.ksistate");
        assert!(load(&path).is_none());

        fs::write(&path, b"KSISTAT").unwrap();
        assert!(load(&path).is_none());

        let mut bytes = encode(&HashAlgorithm::Sha256.digest(b"leaf"));
        bytes[0] = b'X';
        fs::write(&path, bytes).unwrap();
        assert!(load(&path).is_none());
    }

    #[test]
    fn save_replaces_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log.ksistate");

        save(&path, &HashAlgorithm::Sha512.digest(b"first")).unwrap();
        let second = HashAlgorithm::Sha256.digest(b"second");
        save(&path, &second).unwrap();

        assert_eq!(load(&path), Some(second));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
