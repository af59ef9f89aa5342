//! Deterministic assignment of result sets to result chunks
//!
//! Databases written by one build of the server are read by later builds, so
//! the hash must never depend on the process, the platform or the standard
//! library's hasher. It is the 32 bit polynomial string hash
//! (`h = h * 31 + unit`) over the UTF-16 code units of the identifier.

use std::fmt::Display;

use crate::{LsifError, Result};

/// Hashes `id` onto a chunk index in `[0, chunk_count)`.
pub fn hash_key(id: impl Display, chunk_count: i64) -> Result<usize> {
    if chunk_count <= 0 {
        return Err(LsifError::internal_error(format!(
            "result chunk count must be positive, got {chunk_count}"
        )));
    }

    let hash = id
        .to_string()
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)));

    let index = u64::from(hash.unsigned_abs()) % chunk_count as u64;
    Ok(index as usize)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_hash_key_known_values() {
        // "a" = 97, "ab" = 97 * 31 + 98 = 3105
        assert_eq!(hash_key("a", 10).unwrap(), 7);
        assert_eq!(hash_key("ab", 1000).unwrap(), 105);
        assert_eq!(hash_key("", 3).unwrap(), 0);
    }

    #[test]
    fn test_hash_key_numeric_ids_hash_their_decimal_form() {
        let actual = hash_key(42u64, 7).unwrap();
        let expected = hash_key("42", 7).unwrap();

        assert_eq!(actual, expected);
    }

    #[test]
    fn test_hash_key_handles_overflow() {
        // Long enough to wrap the 32 bit accumulator many times over.
        let fixture = "x".repeat(4096);

        let actual = hash_key(&fixture, 13).unwrap();

        assert_eq!(actual, hash_key(&fixture, 13).unwrap());
        assert!(actual < 13);
    }

    #[test]
    fn test_hash_key_handles_min_value() {
        // "polygenelubricants" hashes to i32::MIN
        let actual = hash_key("polygenelubricants", 1 << 20).unwrap();

        assert_eq!(actual, 0);
    }

    #[test]
    fn test_hash_key_stays_in_range() {
        for id in 0..500u64 {
            for chunk_count in [1, 2, 7, 64] {
                let actual = hash_key(id, chunk_count).unwrap();
                assert!(actual < chunk_count as usize);
            }
        }
    }

    #[test]
    fn test_hash_key_rejects_non_positive_chunk_count() {
        assert!(hash_key("a", 0).is_err());
        assert!(hash_key("a", -4).is_err());
    }
}
