//! Crate-wide error type. Every layer (codec, command dispatch, persistence,
//! replication) produces a `RedisError` so the top of the call stack can turn
//! it into a wire reply without downcasting strings.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RedisError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR value is not a valid float")]
    NotAFloat,

    #[error("ERR index out of range")]
    IndexOutOfRange,

    #[error("ERR timeout is not a float or out of range")]
    InvalidTimeout,

    #[error("ERR syntax error")]
    Syntax,

    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    #[error("ERR {0}")]
    Generic(String),

    #[error("ERR {0}")]
    Persistence(String),

    #[error("ERR {0}")]
    Replication(String),

    #[error("ERR {0}")]
    Config(String),

    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    #[error("EXECABORT Transaction discarded because of previous errors.")]
    ExecAbort,

    #[error("ERR MULTI calls can not be nested")]
    NestedMulti,

    #[error("ERR {0} without MULTI")]
    WithoutMulti(String),
}

impl RedisError {
    /// Render as a `-<KIND> <message>\r\n` wire error line.
    pub fn to_reply_line(&self) -> String {
        format!("-{}\r\n", self)
    }
}

pub type RedisResult<T> = Result<T, RedisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_type_renders_wrongtype_prefix() {
        assert_eq!(
            RedisError::WrongType.to_reply_line(),
            "-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"
        );
    }

    #[test]
    fn not_an_integer_message_matches_wire_contract() {
        assert_eq!(
            RedisError::NotAnInteger.to_string(),
            "ERR value is not an integer or out of range"
        );
    }
}
