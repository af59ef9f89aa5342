//! Canonical on-disk representation of raw uploads

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::Path;

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use tempfile::{NamedTempFile, TempPath};

use crate::{LsifError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Gzip uploads may decode to at most this multiple of the maximum file size.
pub const MAX_DECOMPRESSION_RATIO: u64 = 40;

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..])? {
            0 => return Ok(false),
            n => read += n,
        }
    }
    Ok(magic == GZIP_MAGIC)
}

/// Ensures the uploaded file at `raw` is a valid gzip stream.
///
/// Gzip input is verified by decoding it in full and returned as is. Decoding
/// stops with a validation error past `max_decoded` bytes. Any other input is
/// compressed into a new temp file in `tmp_dir` and the uncompressed original
/// is removed. Blocking.
pub fn normalize(raw: TempPath, tmp_dir: &Path, max_decoded: u64) -> Result<TempPath> {
    let storage_err = |e: io::Error| LsifError::storage_error_with_source("normalize upload", e);

    if is_gzip(&raw).map_err(storage_err)? {
        let decoder = MultiGzDecoder::new(BufReader::new(File::open(&raw).map_err(storage_err)?));
        let decoded = io::copy(&mut decoder.take(max_decoded.saturating_add(1)), &mut io::sink())
            .map_err(|e| {
                LsifError::validation_error("body", format!("The given LSIF file is not valid gzip: {e}"))
            })?;
        if decoded > max_decoded {
            return Err(LsifError::validation_error(
                "body",
                format!("The given LSIF file decompresses to more than {max_decoded} bytes"),
            ));
        }
        return Ok(raw);
    }

    let compressed = NamedTempFile::new_in(tmp_dir).map_err(storage_err)?;
    let (file, path) = compressed.into_parts();
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    io::copy(&mut BufReader::new(File::open(&raw).map_err(storage_err)?), &mut encoder)
        .map_err(storage_err)?;
    encoder
        .finish()
        .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
        .map_err(storage_err)?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::read::GzDecoder;
    use pretty_assertions::assert_eq;

    use super::*;

    fn temp_with(dir: &Path, content: &[u8]) -> TempPath {
        let mut file = NamedTempFile::new_in(dir).unwrap();
        file.write_all(content).unwrap();
        file.into_temp_path()
    }

    fn gunzip(path: &Path) -> Vec<u8> {
        let mut actual = Vec::new();
        GzDecoder::new(File::open(path).unwrap()).read_to_end(&mut actual).unwrap();
        actual
    }

    #[test]
    fn test_plain_input_is_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = temp_with(dir.path(), b"{\"id\":1,\"type\":\"vertex\"}\n");

        let actual = normalize(fixture, dir.path(), 1 << 20).unwrap();

        assert!(is_gzip(&actual).unwrap());
        assert_eq!(gunzip(&actual), b"{\"id\":1,\"type\":\"vertex\"}\n".to_vec());
    }

    #[test]
    fn test_gzip_input_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"lsif").unwrap();
        let fixture = temp_with(dir.path(), &encoder.finish().unwrap());
        let original = fixture.to_path_buf();

        let actual = normalize(fixture, dir.path(), 1 << 20).unwrap();

        assert_eq!(actual.to_path_buf(), original);
        assert_eq!(gunzip(&actual), b"lsif".to_vec());
    }

    #[test]
    fn test_truncated_gzip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[7u8; 4096]).unwrap();
        let mut bytes = encoder.finish().unwrap();
        bytes.truncate(bytes.len() / 2);
        let fixture = temp_with(dir.path(), &bytes);

        let actual = normalize(fixture, dir.path(), 1 << 20).unwrap_err();

        assert_eq!(actual.http_status_code(), 400);
    }

    #[test]
    fn test_gzip_expanding_past_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![0u8; 64 * 1024]).unwrap();
        let fixture = temp_with(dir.path(), &encoder.finish().unwrap());

        let actual = normalize(fixture, dir.path(), 1024).unwrap_err();

        assert_eq!(actual.http_status_code(), 400);
        assert_eq!(actual.to_string(), "The given LSIF file decompresses to more than 1024 bytes");
    }

    #[test]
    fn test_gzip_at_limit_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[b'a'; 1024]).unwrap();
        let fixture = temp_with(dir.path(), &encoder.finish().unwrap());

        let actual = normalize(fixture, dir.path(), 1024);

        assert!(actual.is_ok());
    }
}
