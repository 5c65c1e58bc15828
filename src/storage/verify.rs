//! Verification engine
//!
//! Checks mirrored data against the piece-hash table of its torrent.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{MirrorError, VerificationFailure};
use crate::storage::piece::PieceReader;
use crate::torrent::TorrentMetadata;

/// Outcome of a successful verification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Pieces hashed and matched
    pub pieces_checked: usize,
    /// Bytes hashed
    pub bytes_checked: u64,
}

/// Compare two digests without short-circuiting on the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Verify the files of `metadata` under `local_root`
///
/// Fails fast: the first unreadable or mismatching piece ends the check.
/// This does blocking file I/O.
pub fn verify(metadata: &TorrentMetadata, local_root: &Path) -> Result<VerifyReport, MirrorError> {
    let top = local_root.join(&metadata.name);
    if !top.is_dir() && !top.is_file() {
        warn!("Nothing at {}", top.display());
        return Err(MirrorError::verification(VerificationFailure::MissingPath));
    }

    if !metadata.is_consistent() {
        warn!(
            "'{}' declares {} bytes ({} pieces) but carries {} piece hashes",
            metadata.name,
            metadata.total_size(),
            metadata.expected_piece_count(),
            metadata.piece_count()
        );
    }

    debug!("Verifying '{}' ({} pieces) under {}", metadata.name, metadata.piece_count(), local_root.display());

    let reader = PieceReader::new(local_root, metadata.files(), metadata.piece_length);
    let mut report = VerifyReport::default();

    for (result, expected) in reader.zip(metadata.piece_hashes.iter()) {
        let piece = match result {
            Ok(piece) => piece,
            Err(e) => {
                warn!("{}", e);
                return Err(MirrorError::verification_at(VerificationFailure::UnreadablePiece, e.index));
            }
        };

        if !constant_time_eq(&piece.digest(), expected) {
            warn!("Piece {} of '{}': hash mismatch", piece.index, metadata.name);
            return Err(MirrorError::verification_at(VerificationFailure::HashMismatch, piece.index));
        }

        report.pieces_checked += 1;
        report.bytes_checked += piece.data.len() as u64;
    }

    info!("Verified '{}': {} pieces, {} bytes", metadata.name, report.pieces_checked, report.bytes_checked);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::piece::Piece;
    use crate::torrent::{FileEntry, Layout};
    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use tempfile::TempDir;

    fn hashes_of(data: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
        data.chunks(piece_length)
            .enumerate()
            .map(|(index, chunk)| Piece { index, data: chunk.to_vec() }.digest())
            .collect()
    }

    fn random(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    /// Two files of 2509 bytes under `root/pair`, 256-byte pieces
    fn multi_fixture(root: &Path) -> (TorrentMetadata, Vec<u8>) {
        let a = random(2509, 10);
        let b = random(2509, 11);
        std::fs::create_dir_all(root.join("pair")).unwrap();
        std::fs::write(root.join("pair").join("a.bin"), &a).unwrap();
        std::fs::write(root.join("pair").join("b.bin"), &b).unwrap();

        let mut all = a;
        all.extend_from_slice(&b);
        let meta = TorrentMetadata {
            name: "pair".to_string(),
            piece_length: 256,
            piece_hashes: hashes_of(&all, 256),
            layout: Layout::MultiFile(vec![
                FileEntry { path: vec!["a.bin".to_string()], length: 2509 },
                FileEntry { path: vec!["b.bin".to_string()], length: 2509 },
            ]),
            info_hash: None,
        };
        (meta, all)
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sane"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn test_verify_round_trip() {
        let dir = TempDir::new().unwrap();
        let (meta, _) = multi_fixture(dir.path());
        assert_eq!(meta.piece_count(), 20);

        let report = verify(&meta, dir.path()).unwrap();
        assert_eq!(report.pieces_checked, 20);
        assert_eq!(report.bytes_checked, 5018);
    }

    #[test]
    fn test_single_byte_mutation_fails() {
        let dir = TempDir::new().unwrap();
        let (meta, _) = multi_fixture(dir.path());

        let path = dir.path().join("pair").join("b.bin");
        let mut data = std::fs::read(&path).unwrap();
        data[1234] ^= 0x01;
        std::fs::write(&path, data).unwrap();

        let err = verify(&meta, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Verification { failure: VerificationFailure::HashMismatch, piece: Some(14) }
        ));
    }

    #[test]
    fn test_hash_table_mutation_fails() {
        let dir = TempDir::new().unwrap();
        let (mut meta, _) = multi_fixture(dir.path());
        meta.piece_hashes[19][0] ^= 0xff;

        let err = verify(&meta, dir.path()).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_deleted_second_file_never_verifies() {
        let dir = TempDir::new().unwrap();
        let (meta, _) = multi_fixture(dir.path());
        std::fs::remove_file(dir.path().join("pair").join("b.bin")).unwrap();

        let err = verify(&meta, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Verification {
                failure: VerificationFailure::UnreadablePiece | VerificationFailure::MissingPath,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_top_level_path() {
        let dir = TempDir::new().unwrap();
        let (meta, _) = multi_fixture(dir.path());
        std::fs::remove_dir_all(dir.path().join("pair")).unwrap();

        let err = verify(&meta, dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing/invalid path"));
    }

    #[test]
    fn test_single_file_matches_one_file_multi() {
        let dir = TempDir::new().unwrap();
        let data = random(1000, 12);
        std::fs::write(dir.path().join("solo.bin"), &data).unwrap();
        std::fs::create_dir_all(dir.path().join("wrapped")).unwrap();
        std::fs::write(dir.path().join("wrapped").join("solo.bin"), &data).unwrap();

        let single = TorrentMetadata {
            name: "solo.bin".to_string(),
            piece_length: 300,
            piece_hashes: hashes_of(&data, 300),
            layout: Layout::SingleFile(FileEntry { path: vec!["solo.bin".to_string()], length: 1000 }),
            info_hash: None,
        };
        let multi = TorrentMetadata {
            name: "wrapped".to_string(),
            layout: Layout::MultiFile(vec![FileEntry { path: vec!["solo.bin".to_string()], length: 1000 }]),
            ..single.clone()
        };

        let a: Vec<_> = PieceReader::new(dir.path(), single.files(), 300).collect();
        let b: Vec<_> = PieceReader::new(dir.path(), multi.files(), 300).collect();
        assert_eq!(a, b);
        assert!(verify(&single, dir.path()).is_ok());
        assert!(verify(&multi, dir.path()).is_ok());
    }

    #[test]
    fn test_short_hash_table_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let (mut meta, _) = multi_fixture(dir.path());
        meta.piece_hashes.truncate(5);

        let report = verify(&meta, dir.path()).unwrap();
        assert_eq!(report.pieces_checked, 5);
    }

    #[test]
    fn test_huge_declared_lengths_fail_without_panicking() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("huge")).unwrap();
        let max = i64::MAX as u64;
        let meta = TorrentMetadata {
            name: "huge".to_string(),
            piece_length: 16,
            piece_hashes: vec![[0u8; 20]],
            layout: Layout::MultiFile(vec![
                FileEntry { path: vec!["a".to_string()], length: max },
                FileEntry { path: vec!["b".to_string()], length: max },
            ]),
            info_hash: None,
        };

        let err = verify(&meta, dir.path()).unwrap_err();
        assert!(matches!(
            err,
            MirrorError::Verification {
                failure: VerificationFailure::UnreadablePiece,
                ..
            }
        ));
    }
}
