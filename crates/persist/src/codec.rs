//! Byte codecs shared by the stores and the layers above them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use crate::store::StoreError;

/// zstd level used for stored values.
const ZSTD_LEVEL: i32 = 3;

pub fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

pub fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_preserves_nested_values() {
        let v: Vec<(String, [i32; 4])> = vec![("f".into(), [1, -2, 3, 0]), ("v".into(), [0; 4])];
        let bytes = cbor_serialize(&v).unwrap();
        let back: Vec<(String, [i32; 4])> = cbor_deserialize(&bytes).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn zstd_shrinks_repetitive_payloads() {
        let data = vec![7u8; 4096];
        let packed = zstd_compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(zstd_decompress(&packed).unwrap(), data);
    }

    #[test]
    fn cbor_decode_rejects_garbage() {
        let r: Result<Vec<u32>, _> = cbor_deserialize(&[0xff, 0x00, 0x13]);
        assert!(matches!(r, Err(StoreError::CborDecode(_))));
    }

    #[test]
    fn sha256_is_hex() {
        let h = sha256_hex(b"ocme");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
