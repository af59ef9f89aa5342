//! Blob encoding for document and result chunk payloads: gzip-compressed JSON

use std::io::{self, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub fn encode<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.flush()?;
    encoder.finish()
}

pub fn decode<T: DeserializeOwned>(blob: &[u8]) -> serde_json::Result<T> {
    serde_json::from_reader(GzDecoder::new(blob))
}
