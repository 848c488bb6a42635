//! The wire codec (C1): decodes the RESP multibulk request grammar and
//! encodes typed responses back into it.

mod parser;

pub use parser::{parse_request, ParseOutcome};

pub const CRLF: &str = "\r\n";

/// A typed server reply, lowered to bytes by `encode`. Kept as an enum
/// (rather than building strings ad hoc in every handler) so every command
/// handler constructs exactly one value regardless of reply shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NilBulk,
    Array(Vec<Reply>),
    NilArray,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Simple("OK".into())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Reply {
        Reply::Bulk(bytes.into())
    }

    pub fn from_string(s: impl Into<String>) -> Reply {
        Reply::Bulk(s.into().into_bytes())
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(s) => {
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Error(s) => {
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Integer(n) => {
                out.push(b':');
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(CRLF.as_bytes());
            }
            Reply::Bulk(data) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(CRLF.as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(CRLF.as_bytes());
            }
            Reply::NilBulk => out.extend_from_slice(b"$-1\r\n"),
            Reply::NilArray => out.extend_from_slice(b"*-1\r\n"),
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(CRLF.as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

impl From<crate::error::RedisError> for Reply {
    fn from(e: crate::error::RedisError) -> Reply {
        Reply::Error(e.to_string())
    }
}

/// Serialize an argv (already-decoded command) back into the wire request
/// grammar. Used by the append log and by replication propagation, both of
/// which re-emit commands as the bulk-string array form.
pub fn encode_request(argv: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(b'*');
    out.extend_from_slice(argv.len().to_string().as_bytes());
    out.extend_from_slice(CRLF.as_bytes());
    for arg in argv {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF.as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_nil_and_empty_array() {
        assert_eq!(Reply::NilBulk.to_bytes(), b"$-1\r\n");
        assert_eq!(Reply::Array(vec![]).to_bytes(), b"*0\r\n");
    }

    #[test]
    fn encodes_nested_array() {
        let r = Reply::Array(vec![Reply::from_string("q"), Reply::from_string("hello")]);
        assert_eq!(r.to_bytes(), b"*2\r\n$1\r\nq\r\n$5\r\nhello\r\n");
    }

    #[test]
    fn request_roundtrips_through_encode_and_parse() {
        let argv = vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()];
        let bytes = encode_request(&argv);
        match parse_request(&bytes).unwrap() {
            ParseOutcome::Complete { consumed, argv: parsed } => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(parsed, argv);
            }
            other => panic!("expected complete parse, got {other:?}"),
        }
    }
}
