const STANDARD: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const URL_SAFE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Alphabet {
    Standard,
    UrlSafe,
}

impl Alphabet {
    fn table(self) -> &'static [u8; 64] {
        match self {
            Alphabet::Standard => STANDARD,
            Alphabet::UrlSafe => URL_SAFE,
        }
    }
}

pub fn encode_base64(bytes: &[u8]) -> String {
    encode_base64_with(bytes, Alphabet::Standard)
}

pub fn encode_base64_with(bytes: &[u8], alphabet: Alphabet) -> String {
    let table = alphabet.table();
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let n = chunk
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | (u32::from(*b) << (16 - 8 * i)));
        for i in 0..4 {
            if i <= chunk.len() {
                let idx = (n >> (18 - 6 * i)) & 0x3f;
                out.push(table[idx as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

/// Decodes either alphabet. Padding is optional; whitespace is ignored.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut acc = 0u32;
    let mut bits = 0u32;
    let mut seen_padding = false;
    for (pos, ch) in input.bytes().enumerate() {
        if ch.is_ascii_whitespace() {
            continue;
        }
        if ch == b'=' {
            seen_padding = true;
            continue;
        }
        if seen_padding {
            return Err(format!("unexpected data after padding at offset {pos}"));
        }
        let value = sextet(ch).ok_or_else(|| format!("invalid base64 character '{}'", ch as char))?;
        acc = (acc << 6) | u32::from(value);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    if bits >= 6 {
        return Err("truncated base64 input".to_string());
    }
    Ok(out)
}

fn sextet(ch: u8) -> Option<u8> {
    match ch {
        b'A'..=b'Z' => Some(ch - b'A'),
        b'a'..=b'z' => Some(ch - b'a' + 26),
        b'0'..=b'9' => Some(ch - b'0' + 52),
        b'+' | b'-' => Some(62),
        b'/' | b'_' => Some(63),
        _ => None,
    }
}

pub fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{Alphabet, decode_base64, encode_base64, encode_base64_with, encode_hex};

    #[test]
    fn encodes_with_padding() {
        assert_eq!(encode_base64(b"edge"), "ZWRnZQ==");
        assert_eq!(encode_base64(b"edgesim"), "ZWRnZXNpbQ==");
        assert_eq!(encode_base64(b""), "");
    }

    #[test]
    fn url_safe_alphabet() {
        assert_eq!(encode_base64_with(&[0xfb, 0xff], Alphabet::UrlSafe), "-_8=");
    }

    #[test]
    fn decodes_unpadded_input() {
        assert_eq!(decode_base64("ZWRnZQ").expect("decode"), b"edge");
        assert_eq!(decode_base64("ZWRnZXNpbQ==").expect("decode"), b"edgesim");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_base64("ZW*n").is_err());
        assert!(decode_base64("ZQ==ZQ").is_err());
    }

    #[test]
    fn hex_is_lowercase() {
        assert_eq!(encode_hex(&[0x00, 0xab, 0x7f]), "00ab7f");
    }
}
