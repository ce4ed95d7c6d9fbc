/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Payload scrambling for relay transit.
//!
//! This is NOT encryption. Bytes are XORed with the room keyword (repeating) and base64
//! encoded, which only keeps payloads from being readable at a glance on a shared relay.
//! Anyone who knows or guesses the keyword can read and forge them. The scheme is kept
//! bit-exact because every peer in a room has to produce the same bytes.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};

#[derive(Debug, thiserror::Error)]
pub enum ObfuscationError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

fn xor_with_key(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= key[i % key.len()];
    }
}

pub fn encode(plain: &[u8], key: &str) -> String {
    let mut buf = plain.to_vec();
    xor_with_key(&mut buf, key.as_bytes());
    B64.encode(buf)
}

pub fn decode(encoded: &str, key: &str) -> Result<Vec<u8>, ObfuscationError> {
    let mut buf = B64.decode(encoded.trim().as_bytes())?;
    xor_with_key(&mut buf, key.as_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // 'a'^'k' = 0x0a, 'b'^'e' = 0x07, 'c'^'y' = 0x1a, 'd'^'k' = 0x0f
        assert_eq!(encode(b"abcd", "key"), B64.encode([0x0a, 0x07, 0x1a, 0x0f]));
    }

    #[test]
    fn round_trips_utf8_payloads() {
        let payloads = [
            "",
            "{}",
            r#"{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"}"#,
            "ключ 🔑 鍵",
        ];
        for key in ["k", "room1", "пароль", "a much longer key than the payload itself"] {
            for p in payloads {
                let enc = encode(p.as_bytes(), key);
                let dec = decode(&enc, key).unwrap();
                assert_eq!(dec, p.as_bytes(), "key={key} payload={p}");
            }
        }
    }

    #[test]
    fn wrong_key_scrambles() {
        let enc = encode(br#"{"type":"offer"}"#, "alpha");
        let dec = decode(&enc, "bravo").unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&dec).is_err());
    }

    #[test]
    fn empty_key_is_plain_base64() {
        assert_eq!(encode(b"hello", ""), B64.encode(b"hello"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("not base64 !!", "k").is_err());
    }
}
