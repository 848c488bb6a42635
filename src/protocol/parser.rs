//! Multibulk request parser: `*<n>\r\n($<len>\r\n<len bytes>\r\n){n}`, plus
//! the inline request form interactive clients use (§6): a bare line of
//! whitespace-separated, optionally double-quoted tokens.
//!
//! `parse_request` consumes a single complete request from the front of a
//! byte buffer. It never blocks on partial input — instead it returns
//! `NeedMore` so the caller can wait for more bytes from the socket.

use crate::error::RedisError;

/// Matches real Redis's inline request cap; stops a client that never
/// sends a newline from growing the buffer without bound.
const INLINE_MAX_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A full request was parsed; `consumed` bytes should be drained from
    /// the front of the buffer.
    Complete { consumed: usize, argv: Vec<Vec<u8>> },
    /// The buffer does not yet hold a complete request; consumed nothing.
    NeedMore,
}

/// Find the next `\r\n`, returning the index of the `\r`.
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_usize_line(buf: &[u8]) -> Result<usize, RedisError> {
    if buf.is_empty() || !buf.iter().all(|b| b.is_ascii_digit()) {
        return Err(RedisError::Protocol("invalid length".into()));
    }
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| RedisError::Protocol("invalid length".into()))
}

fn parse_isize_line(buf: &[u8]) -> Result<isize, RedisError> {
    if buf.is_empty() {
        return Err(RedisError::Protocol("invalid length".into()));
    }
    let (neg, digits) = if buf[0] == b'-' { (true, &buf[1..]) } else { (false, buf) };
    if digits.is_empty() || !digits.iter().all(|b| b.is_ascii_digit()) {
        return Err(RedisError::Protocol("invalid length".into()));
    }
    let n: isize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<isize>().ok())
        .ok_or_else(|| RedisError::Protocol("invalid length".into()))?;
    Ok(if neg { -n } else { n })
}

/// Parse a single request out of `buf`. Returns `Ok(ParseOutcome::NeedMore)`
/// when more bytes are required, and `Err` when the bytes are malformed
/// (the caller must close the connection without replying).
pub fn parse_request(buf: &[u8]) -> Result<ParseOutcome, RedisError> {
    if buf.is_empty() {
        return Ok(ParseOutcome::NeedMore);
    }
    if buf[0] != b'*' {
        return parse_inline(buf);
    }

    let Some(first_crlf) = find_crlf(buf) else {
        return Ok(ParseOutcome::NeedMore);
    };
    let count = parse_isize_line(&buf[1..first_crlf])?;
    if count < 0 {
        // *-1\r\n is a null array; treat as an empty request (no-op).
        return Ok(ParseOutcome::Complete {
            consumed: first_crlf + 2,
            argv: Vec::new(),
        });
    }
    let count = count as usize;

    let mut pos = first_crlf + 2;
    let mut argv = Vec::with_capacity(count);

    for _ in 0..count {
        if pos >= buf.len() {
            return Ok(ParseOutcome::NeedMore);
        }
        if buf[pos] != b'$' {
            return Err(RedisError::Protocol(
                "expected '$' bulk-string prefix".into(),
            ));
        }
        let Some(len_crlf) = find_crlf(&buf[pos + 1..]) else {
            return Ok(ParseOutcome::NeedMore);
        };
        let len_crlf = pos + 1 + len_crlf;
        let len = parse_usize_line(&buf[pos + 1..len_crlf])?;

        let data_start = len_crlf + 2;
        let data_end = data_start + len;
        if data_end + 2 > buf.len() {
            return Ok(ParseOutcome::NeedMore);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RedisError::Protocol(
                "bulk string not terminated by CRLF".into(),
            ));
        }

        argv.push(buf[data_start..data_end].to_vec());
        pos = data_end + 2;
    }

    Ok(ParseOutcome::Complete { consumed: pos, argv })
}

/// Parse one line of an inline request: whitespace-separated tokens,
/// optionally double-quoted with `\`-escapes, terminated by `\n` (with or
/// without a preceding `\r`).
fn parse_inline(buf: &[u8]) -> Result<ParseOutcome, RedisError> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > INLINE_MAX_LEN {
            return Err(RedisError::Protocol("inline request too long".into()));
        }
        return Ok(ParseOutcome::NeedMore);
    };
    let line_end = if nl > 0 && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
    let argv = tokenize_inline(&buf[..line_end])?;
    Ok(ParseOutcome::Complete { consumed: nl + 1, argv })
}

fn tokenize_inline(line: &[u8]) -> Result<Vec<Vec<u8>>, RedisError> {
    let mut argv = Vec::new();
    let mut i = 0;
    while i < line.len() {
        while i < line.len() && line[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        if line[i] == b'"' {
            i += 1;
            let mut token = Vec::new();
            loop {
                if i >= line.len() {
                    return Err(RedisError::Protocol("unbalanced quotes in inline request".into()));
                }
                match line[i] {
                    b'"' => {
                        i += 1;
                        break;
                    }
                    b'\\' if i + 1 < line.len() => {
                        token.push(line[i + 1]);
                        i += 2;
                    }
                    b => {
                        token.push(b);
                        i += 1;
                    }
                }
            }
            argv.push(token);
        } else {
            let start = i;
            while i < line.len() && !line[i].is_ascii_whitespace() {
                i += 1;
            }
            argv.push(line[start..i].to_vec());
        }
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn need_more_on_empty_and_truncated_input() {
        assert_eq!(parse_request(b"").unwrap(), ParseOutcome::NeedMore);
        assert_eq!(parse_request(b"*1\r\n$4\r\nPIN").unwrap(), ParseOutcome::NeedMore);
    }

    #[test]
    fn parses_simple_ping() {
        let outcome = parse_request(b"*1\r\n$4\r\nPING\r\n").unwrap();
        assert_eq!(
            outcome,
            ParseOutcome::Complete {
                consumed: 14,
                argv: vec![b"PING".to_vec()]
            }
        );
    }

    #[test]
    fn parses_set_with_trailing_bytes_left_unconsumed() {
        let input = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\nEXTRA";
        let outcome = parse_request(input).unwrap();
        match outcome {
            ParseOutcome::Complete { consumed, argv } => {
                assert_eq!(argv, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
                assert_eq!(&input[consumed..], b"EXTRA");
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn rejects_non_digit_length() {
        assert!(parse_request(b"*1\r\n$a\r\nX\r\n").is_err());
    }

    #[test]
    fn rejects_mismatched_bulk_terminator() {
        assert!(parse_request(b"*1\r\n$1\r\nXY\r\n").is_err());
    }

    #[test]
    fn parses_inline_request_without_array_prefix() {
        let outcome = parse_request(b"PING\r\n").unwrap();
        assert_eq!(
            outcome,
            ParseOutcome::Complete { consumed: 6, argv: vec![b"PING".to_vec()] }
        );
    }

    #[test]
    fn parses_inline_request_with_quoted_token_containing_spaces() {
        let outcome = parse_request(b"SET greeting \"hello world\"\r\n").unwrap();
        match outcome {
            ParseOutcome::Complete { argv, .. } => {
                assert_eq!(argv, vec![b"SET".to_vec(), b"greeting".to_vec(), b"hello world".to_vec()]);
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn inline_request_needs_more_until_newline() {
        assert_eq!(parse_request(b"PIN").unwrap(), ParseOutcome::NeedMore);
    }

    #[test]
    fn rejects_unbalanced_quotes_in_inline_request() {
        assert!(parse_request(b"SET k \"unterminated\r\n").is_err());
    }
}
