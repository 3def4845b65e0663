//! `application/x-www-form-urlencoded` parsing.
//!
//! Splits pairs on `&`/`=` via `memchr`, then percent-decodes each key and
//! value, enforcing the `maxInputVars`/`maxFieldLen` ceilings from
//! `Options`. Ceiling violations are reported as a recoverable
//! `ClientSizeException` rather than a local `Error` enum, so callers (the
//! request pipeline) handle it the same way as a body-size overflow.

use crate::errors::ClientSizeException;
use memchr::memchr;

/// Parses a query string or urlencoded body into ordered, percent-decoded
/// pairs. Preserves repeated keys and insertion order.
pub fn parse(data: &[u8], max_vars: usize, max_field_len: usize) -> Result<Vec<(String, String)>, ClientSizeException> {
    let data = match data.first() {
        Some(b'?') => &data[1..],
        _ => data,
    };

    let mut result = Vec::new();
    let mut start = 0;
    while start < data.len() {
        if result.len() >= max_vars {
            return Err(ClientSizeException {
                limit: max_vars,
                observed: result.len() + 1,
            });
        }

        let end = memchr(b'&', &data[start..]).map(|p| start + p).unwrap_or(data.len());
        let segment = &data[start..end];
        let split = memchr(b'=', segment);

        let (key_raw, value_raw) = match split {
            Some(idx) => (&segment[..idx], &segment[idx + 1..]),
            None => (segment, &b""[..]),
        };

        if key_raw.len() > max_field_len || value_raw.len() > max_field_len {
            return Err(ClientSizeException {
                limit: max_field_len,
                observed: key_raw.len().max(value_raw.len()),
            });
        }

        let key = decode_form_component(key_raw);
        let value = decode_form_component(value_raw);
        result.push((key, value));
        start = end + 1;
    }

    Ok(result)
}

/// Percent- and `+`-decodes a single urlencoded key or value.
fn decode_form_component(src: &[u8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < src.len() => {
                let hi = hex_val(src[i + 1]);
                let lo = hex_val(src[i + 2]);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(src[i]);
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[inline]
fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_and_empty_values() {
        let parsed = parse(b"flag&empty=&key=value&key=again", 10, 1024).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("flag".to_string(), "".to_string()),
                ("empty".to_string(), "".to_string()),
                ("key".to_string(), "value".to_string()),
                ("key".to_string(), "again".to_string()),
            ]
        );
    }

    #[test]
    fn decodes_percent_and_plus() {
        let parsed = parse(b"name=John+Doe&email=a%40b.com", 10, 1024).unwrap();
        assert_eq!(parsed[0], ("name".to_string(), "John Doe".to_string()));
        assert_eq!(parsed[1], ("email".to_string(), "a@b.com".to_string()));
    }

    #[test]
    fn enforces_max_vars() {
        let err = parse(b"a=1&b=2&c=3", 2, 1024).unwrap_err();
        assert_eq!(err.limit, 2);
    }

    #[test]
    fn enforces_max_field_len() {
        let long_value = "x".repeat(10);
        let body = format!("k={}", long_value);
        let err = parse(body.as_bytes(), 10, 4).unwrap_err();
        assert_eq!(err.limit, 4);
    }

    #[test]
    fn leading_question_mark_is_stripped() {
        let parsed = parse(b"?a=1", 10, 1024).unwrap();
        assert_eq!(parsed, vec![("a".to_string(), "1".to_string())]);
    }
}
