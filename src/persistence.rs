
use bincode::Options;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Bumped whenever the serialized layout of the graph or index changes
pub const FORMAT_VERSION: u32 = 1;
/// Largest header or body accepted on read, so a corrupt length prefix fails instead of allocating
pub const MAX_ARTIFACT_BYTES: u64 = 1 << 34;

/// Same layout as `bincode::serialize`, with a size limit
fn artifact_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(MAX_ARTIFACT_BYTES)
}

#[derive(thiserror::Error, Debug)]
pub enum GraphFormatError {
    #[error("failed to access {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("{path:?} is not a {expected} file (bad magic bytes)")]
    BadMagic { path: PathBuf, expected: &'static str },
    #[error("{path:?} has format version {found}, expected {expected}")]
    UnsupportedVersion { path: PathBuf, found: u32, expected: u32 },
    #[error("{path:?} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("index was built for graph {index_fingerprint:016x}, but the loaded graph is {graph_fingerprint:016x}")]
    VersionMismatch { index_fingerprint: u64, graph_fingerprint: u64 }
}

/// Small fixed header written after the magic bytes
#[derive(Serialize, Deserialize)]
struct ArtifactHeader {
    format_version: u32,
    graph_fingerprint: u64
}

/// Writes `magic`, a version header, and then the bincode body.
/// # Arguments
/// * `path` - the output file, overwritten if present
/// * `magic` - 8 bytes identifying the artifact type
/// * `graph_fingerprint` - fingerprint of the graph this artifact belongs to
/// * `body` - the data to serialize
/// # Errors
/// * if the file cannot be created or serialization fails
pub fn write_artifact<T: Serialize>(path: &Path, magic: &[u8; 8], graph_fingerprint: u64, body: &T) -> Result<(), GraphFormatError> {
    let io_error = |source: std::io::Error| GraphFormatError::Io { path: path.to_path_buf(), source };
    let corrupt = |e: bincode::Error| GraphFormatError::Corrupt { path: path.to_path_buf(), message: e.to_string() };

    let file = File::create(path).map_err(io_error)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(magic).map_err(io_error)?;
    let header = ArtifactHeader {
        format_version: FORMAT_VERSION,
        graph_fingerprint
    };
    artifact_options().serialize_into(&mut writer, &header).map_err(corrupt)?;
    artifact_options().serialize_into(&mut writer, body).map_err(corrupt)?;
    writer.flush().map_err(io_error)?;
    Ok(())
}

/// Reads an artifact written by `write_artifact`, returning the stored graph fingerprint and the body.
/// # Arguments
/// * `path` - the input file
/// * `magic` - the expected 8 magic bytes
/// * `label` - human readable artifact type for errors
/// # Errors
/// * if the file cannot be read, has the wrong magic, the wrong version, or fails to deserialize
pub fn read_artifact<T: DeserializeOwned>(path: &Path, magic: &[u8; 8], label: &'static str) -> Result<(u64, T), GraphFormatError> {
    let io_error = |source: std::io::Error| GraphFormatError::Io { path: path.to_path_buf(), source };
    let corrupt = |e: bincode::Error| GraphFormatError::Corrupt { path: path.to_path_buf(), message: e.to_string() };

    let file = File::open(path).map_err(io_error)?;
    let mut reader = BufReader::new(file);
    let mut found_magic: [u8; 8] = [0; 8];
    if reader.read_exact(&mut found_magic).is_err() || &found_magic != magic {
        return Err(GraphFormatError::BadMagic { path: path.to_path_buf(), expected: label });
    }

    let header: ArtifactHeader = artifact_options().deserialize_from(&mut reader).map_err(corrupt)?;
    if header.format_version != FORMAT_VERSION {
        return Err(GraphFormatError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: header.format_version,
            expected: FORMAT_VERSION
        });
    }
    let body: T = artifact_options().deserialize_from(&mut reader).map_err(corrupt)?;
    Ok((header.graph_fingerprint, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAGIC: &[u8; 8] = b"GTTEST\0\0";

    fn header_bytes(format_version: u32) -> Vec<u8> {
        let mut bytes: Vec<u8> = TEST_MAGIC.to_vec();
        bytes.extend(bincode::serialize(&ArtifactHeader { format_version, graph_fingerprint: 0 }).unwrap());
        bytes
    }

    #[test]
    fn test_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("round_trip.bin");
        let body: Vec<(u64, String)> = vec![(1, "one".to_string()), (2, "two".to_string())];
        write_artifact(&path, TEST_MAGIC, 0xdead_beef, &body).unwrap();
        let (fingerprint, loaded): (u64, Vec<(u64, String)>) = read_artifact(&path, TEST_MAGIC, "test").unwrap();
        assert_eq!(fingerprint, 0xdead_beef);
        assert_eq!(loaded, body);
    }

    #[test]
    fn test_bad_magic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad_magic.bin");
        write_artifact(&path, b"GTOTHER\0", 1, &vec![1_u8]).unwrap();
        let result: Result<(u64, Vec<u8>), GraphFormatError> = read_artifact(&path, TEST_MAGIC, "test");
        assert!(matches!(result, Err(GraphFormatError::BadMagic { .. })));

        // too short to even hold the magic
        std::fs::write(&path, b"GT").unwrap();
        let result: Result<(u64, Vec<u8>), GraphFormatError> = read_artifact(&path, TEST_MAGIC, "test");
        assert!(matches!(result, Err(GraphFormatError::BadMagic { .. })));
    }

    #[test]
    fn test_bad_version() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad_version.bin");
        let mut bytes = header_bytes(FORMAT_VERSION + 1);
        bytes.extend(bincode::serialize(&vec![1_u8]).unwrap());
        std::fs::write(&path, &bytes).unwrap();
        let result: Result<(u64, Vec<u8>), GraphFormatError> = read_artifact(&path, TEST_MAGIC, "test");
        assert!(matches!(result, Err(GraphFormatError::UnsupportedVersion { found, .. }) if found == FORMAT_VERSION + 1));
    }

    #[test]
    fn test_truncated_body() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("truncated.bin");
        std::fs::write(&path, header_bytes(FORMAT_VERSION)).unwrap();
        let result: Result<(u64, Vec<String>), GraphFormatError> = read_artifact(&path, TEST_MAGIC, "test");
        assert!(matches!(result, Err(GraphFormatError::Corrupt { .. })));

        let missing: Result<(u64, Vec<String>), GraphFormatError> = read_artifact(&temp_dir.path().join("missing.bin"), TEST_MAGIC, "test");
        assert!(matches!(missing, Err(GraphFormatError::Io { .. })));
    }

    #[test]
    fn test_oversized_length_prefix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("oversized.bin");
        // a string claiming far more bytes than the limit allows
        let mut bytes = header_bytes(FORMAT_VERSION);
        bytes.extend((MAX_ARTIFACT_BYTES * 64).to_le_bytes());
        bytes.extend(b"abc");
        std::fs::write(&path, &bytes).unwrap();
        let result: Result<(u64, String), GraphFormatError> = read_artifact(&path, TEST_MAGIC, "test");
        assert!(matches!(result, Err(GraphFormatError::Corrupt { .. })));

        // the limited encoding is the plain bincode layout
        let body: Vec<u32> = vec![3, 1, 4];
        write_artifact(&path, TEST_MAGIC, 7, &body).unwrap();
        let mut expected = TEST_MAGIC.to_vec();
        expected.extend(bincode::serialize(&ArtifactHeader { format_version: FORMAT_VERSION, graph_fingerprint: 7 }).unwrap());
        expected.extend(bincode::serialize(&body).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }
}
