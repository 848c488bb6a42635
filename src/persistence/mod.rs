//! Snapshot (RDB-style) and append-log (AOF-style) persistence, §4.5/§4.6.

pub mod aof;
pub mod rdb;
