//! Configuration loading (§6): a flat key→value table populated from an
//! optional `redis.conf`-style file, then overridden by `--key value` CLI
//! flags. Parsing request bytes, logging setup and the REPL client are
//! separate external collaborators; this module only owns the table and
//! the handful of typed accessors the rest of the engine needs.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Config {
    values: HashMap<String, String>,
    /// `save <sec> <changes>` may be repeated; kept aside from the flat map.
    pub save_points: Vec<(u64, u64)>,
}

impl Default for Config {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert("ip".into(), "127.0.0.1".into());
        values.insert("port".into(), "6379".into());
        values.insert("engine".into(), "mmdb".into());
        values.insert("databases".into(), "16".into());
        values.insert("maxmemory".into(), "0".into());
        values.insert("maxmemory-policy".into(), "noeviction".into());
        values.insert("maxmemory-samples".into(), "5".into());
        values.insert("appendonly".into(), "no".into());
        values.insert("appendfsync".into(), "everysec".into());
        values.insert("appendfilename".into(), "appendonly.aof".into());
        values.insert("dbfilename".into(), "dump.rdb".into());
        values.insert("dir".into(), ".".into());
        values.insert("repl-timeout".into(), "60".into());
        values.insert("repl-ping-period".into(), "10".into());
        values.insert("repl-backlog-size".into(), "1048576".into());
        values.insert("slowlog-log-slower-than".into(), "10000".into());
        values.insert("slowlog-max-len".into(), "128".into());
        Config { values, save_points: vec![(900, 1), (300, 10), (60, 10000)] }
    }
}

impl Config {
    /// Load defaults, then a config file (if given), then CLI `--key value` pairs.
    pub fn load(file_path: Option<&Path>, cli_args: &[String]) -> Result<Config> {
        let mut cfg = Config::default();
        if let Some(path) = file_path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            cfg.apply_file(&text);
        }
        cfg.apply_cli(cli_args)?;
        Ok(cfg)
    }

    fn apply_file(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else { continue };
            let rest: Vec<&str> = parts.collect();
            self.set_from_directive(key, &rest);
        }
    }

    fn apply_cli(&mut self, args: &[String]) -> Result<()> {
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            let Some(key) = arg.strip_prefix("--") else {
                i += 1;
                continue;
            };
            let mut rest = Vec::new();
            let mut j = i + 1;
            while j < args.len() && !args[j].starts_with("--") {
                rest.push(args[j].as_str());
                j += 1;
            }
            self.set_from_directive(key, &rest);
            i = j;
        }
        Ok(())
    }

    fn set_from_directive(&mut self, key: &str, rest: &[&str]) {
        let key = key.to_ascii_lowercase();
        if key == "save" && rest.len() == 2 {
            if let (Ok(sec), Ok(changes)) = (rest[0].parse(), rest[1].parse()) {
                self.save_points.push((sec, changes));
                return;
            }
        }
        if key == "slaveof" && rest.len() == 2 {
            self.values.insert("slaveof-ip".into(), rest[0].to_string());
            self.values.insert("slaveof-port".into(), rest[1].to_string());
            return;
        }
        self.values.insert(key, rest.join(" "));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_ascii_lowercase(), value.to_string());
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    }

    pub fn databases(&self) -> usize {
        self.get_usize("databases", 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_populated() {
        let cfg = Config::default();
        assert_eq!(cfg.get("port"), Some("6379"));
        assert_eq!(cfg.databases(), 16);
    }

    #[test]
    fn file_directives_override_defaults() {
        let mut cfg = Config::default();
        cfg.apply_file("port 7000\n# comment\ndatabases 4\nsave 60 1\n");
        assert_eq!(cfg.get("port"), Some("7000"));
        assert_eq!(cfg.databases(), 4);
        assert!(cfg.save_points.contains(&(60, 1)));
    }

    #[test]
    fn cli_flags_override_file() {
        let mut cfg = Config::default();
        cfg.apply_cli(&["--port".into(), "9999".into()]).unwrap();
        assert_eq!(cfg.get("port"), Some("9999"));
    }
}
