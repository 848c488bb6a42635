//! `alice-sentinel`: monitors configured masters, detects down state, and
//! drives failover via the C9 protocol (§4.9). Unlike the data-store
//! engine, a sentinel's state is small and read far more often than it is
//! written, so it is shared behind `Arc<RwLock<...>>` the way the
//! teacher's `main.rs` shares its db and replication config, rather than
//! owned by a single task.

use alice::protocol::{encode_request, parse_request, ParseOutcome, Reply};
use alice::sentinel::election::{has_won_election, ElectionState, VoteOutcome};
use alice::sentinel::{is_odown, pick_failover_candidate, DownState, MonitoredMaster, SentinelState, SlaveRecord};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

#[derive(Clone)]
struct MonitorSpec {
    name: String,
    ip: String,
    port: u16,
    quorum: usize,
    down_after_ms: i64,
}

struct SentinelConfig {
    ip: String,
    port: u16,
    monitors: Vec<MonitorSpec>,
}

impl SentinelConfig {
    /// `sentinel monitor <name> <ip> <port> <quorum>` plus
    /// `sentinel down-after-milliseconds <name> <ms>`, `port`, `ip` (§6).
    fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut ip = "127.0.0.1".to_string();
        let mut port = 26379u16;
        let mut monitors: HashMap<String, MonitorSpec> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["port", p] => port = p.parse().unwrap_or(port),
                ["ip", i] => ip = i.to_string(),
                ["sentinel", "monitor", name, mip, mport, quorum] => {
                    monitors.insert(
                        (*name).to_string(),
                        MonitorSpec {
                            name: (*name).to_string(),
                            ip: (*mip).to_string(),
                            port: mport.parse().unwrap_or(0),
                            quorum: quorum.parse().unwrap_or(1),
                            down_after_ms: 30_000,
                        },
                    );
                }
                ["sentinel", "down-after-milliseconds", name, ms] => {
                    if let Some(m) = monitors.get_mut(*name) {
                        m.down_after_ms = ms.parse().unwrap_or(30_000);
                    }
                }
                _ => {}
            }
        }
        Ok(SentinelConfig { ip, port, monitors: monitors.into_values().collect() })
    }
}

/// Everything this instance knows: the monitored masters/slaves, its own
/// election bookkeeping, and the peer sentinels it has heard from.
struct Runtime {
    state: SentinelState,
    election: ElectionState,
    down: HashMap<String, DownState>,
    run_id: String,
    peers: Vec<(String, u16)>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(path) = args.first() else {
        anyhow::bail!("usage: alice-sentinel <sentinel.conf>");
    };
    let config = SentinelConfig::load(std::path::Path::new(path))?;

    let mut state = SentinelState::new();
    for m in &config.monitors {
        state.masters.insert(
            m.name.clone(),
            MonitoredMaster {
                name: m.name.clone(),
                ip: m.ip.clone(),
                port: m.port,
                quorum: m.quorum,
                down_after_ms: m.down_after_ms,
                last_heartbeat_ms: now_ms(),
            },
        );
        state.slaves.insert(m.name.clone(), Vec::new());
    }

    let runtime = Arc::new(RwLock::new(Runtime {
        state,
        election: ElectionState::new(),
        down: HashMap::new(),
        run_id: generate_run_id(),
        peers: Vec::new(),
    }));

    let listen_addr = format!("{}:{}", config.ip, config.port);
    let listener = TcpListener::bind(&listen_addr).await.with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(addr = %listen_addr, "sentinel listening");

    let command_runtime = runtime.clone();
    let command_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let runtime = command_runtime.clone();
                    tokio::spawn(handle_peer(stream, addr, runtime));
                }
                Err(e) => tracing::warn!(%e, "accept failed"),
            }
        }
    });

    let mut monitor_tasks = Vec::new();
    for m in config.monitors {
        let runtime = runtime.clone();
        monitor_tasks.push(tokio::spawn(monitor_master(m, runtime)));
    }

    let _ = command_task.await;
    for t in monitor_tasks {
        let _ = t.await;
    }
    Ok(())
}

fn now_ms() -> i64 {
    alice::util::now_ms()
}

fn generate_run_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..40).map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap()).collect()
}

/// Heartbeat one master: PING it every second, mark it SDOWN on the
/// configured deadline, poll every known peer sentinel, and decide
/// ODOWN/election/failover from their agreement (§4.9 Down detection).
async fn monitor_master(spec: MonitorSpec, runtime: Arc<RwLock<Runtime>>) {
    loop {
        tokio::time::sleep(Duration::from_millis(1000)).await;
        let alive = ping(&spec.ip, spec.port).await.is_ok();

        let mut rt = runtime.write().await;
        if alive {
            if let Some(master) = rt.state.masters.get_mut(&spec.name) {
                master.last_heartbeat_ms = now_ms();
            }
            rt.down.insert(spec.name.clone(), DownState::Up);
            continue;
        }
        let is_sdown = rt.state.masters.get(&spec.name).map(|m| m.is_sdown(now_ms())).unwrap_or(false);
        if !is_sdown {
            continue;
        }
        tracing::warn!(master = %spec.name, "subjectively down");
        rt.down.insert(spec.name.clone(), DownState::Sdown);
        let peers = rt.peers.clone();
        let quorum = spec.quorum;
        let run_id = rt.run_id.clone();
        let epoch = rt.election.start_failover(&spec.name, &run_id);
        drop(rt);

        let mut agreements = 1; // this sentinel's own vote
        for (peer_ip, peer_port) in &peers {
            if ask_peer_down(peer_ip, *peer_port, &spec, epoch, &run_id).await {
                agreements += 1;
            }
        }

        if is_odown(agreements, peers.len(), quorum) {
            tracing::warn!(master = %spec.name, agreements, "objectively down");
            runtime.write().await.down.insert(spec.name.clone(), DownState::Odown);
            if has_won_election(agreements, peers.len(), quorum) {
                run_failover(&spec, runtime.clone()).await;
            }
        }
    }
}

async fn ping(ip: &str, port: u16) -> Result<()> {
    let mut stream = tokio::time::timeout(Duration::from_millis(500), TcpStream::connect((ip, port))).await??;
    stream.write_all(&encode_request(&[b"PING".to_vec()])).await?;
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await??;
    if n == 0 {
        anyhow::bail!("connection closed");
    }
    Ok(())
}

/// Ask one peer sentinel whether it also sees `spec`'s master as down,
/// casting our vote for this failover epoch in the same round trip (real
/// Sentinel's `is-master-down-by-addr` and vote request are distinct
/// commands; this crate's peer protocol folds them into one, §4.9 step 4).
async fn ask_peer_down(ip: &str, port: u16, spec: &MonitorSpec, epoch: u64, candidate_run_id: &str) -> bool {
    let attempt = async {
        let mut stream = TcpStream::connect((ip, port)).await?;
        let argv = vec![
            b"SENTINEL".to_vec(),
            b"is-master-down-by-addr".to_vec(),
            spec.ip.clone().into_bytes(),
            spec.port.to_string().into_bytes(),
            epoch.to_string().into_bytes(),
            candidate_run_id.as_bytes().to_vec(),
        ];
        stream.write_all(&encode_request(&argv)).await?;
        let mut buf = vec![0u8; 512];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        anyhow::Ok(buf)
    };
    match tokio::time::timeout(Duration::from_millis(500), attempt).await {
        // `*3\r\n:1` is the array-of-three reply with a leading down=1.
        Ok(Ok(reply)) => reply.starts_with(b"*3\r\n:1"),
        _ => false,
    }
}

/// Promote the ranked failover candidate once this sentinel has won the
/// election: tell it `SLAVEOF NO ONE` and adopt it as the new master
/// address (§4.9 Failover).
async fn run_failover(spec: &MonitorSpec, runtime: Arc<RwLock<Runtime>>) {
    let candidate: Option<SlaveRecord> = {
        let rt = runtime.read().await;
        rt.state.slaves.get(&spec.name).and_then(|slaves| pick_failover_candidate(slaves).cloned())
    };
    let Some(candidate) = candidate else {
        tracing::warn!(master = %spec.name, "no slave available for failover");
        return;
    };
    tracing::info!(master = %spec.name, promoted = %candidate.ip, "promoting slave");
    if let Ok(mut stream) = TcpStream::connect((candidate.ip.as_str(), candidate.port)).await {
        let _ = stream.write_all(&encode_request(&[b"SLAVEOF".to_vec(), b"NO".to_vec(), b"ONE".to_vec()])).await;
    }
    let mut rt = runtime.write().await;
    if let Some(master) = rt.state.masters.get_mut(&spec.name) {
        master.ip = candidate.ip.clone();
        master.port = candidate.port;
        master.last_heartbeat_ms = now_ms();
    }
    rt.down.insert(spec.name.clone(), DownState::Up);
}

/// Serve the small command surface peer sentinels speak to this instance:
/// PING, INFO, and SENTINEL IS-MASTER-DOWN-BY-ADDR.
async fn handle_peer(mut stream: TcpStream, addr: SocketAddr, runtime: Arc<RwLock<Runtime>>) {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 4096];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(_) => return,
        }
        loop {
            match parse_request(&buf) {
                Ok(ParseOutcome::Complete { consumed, argv }) => {
                    buf.drain(..consumed);
                    if argv.is_empty() {
                        continue;
                    }
                    let reply = dispatch_peer_command(&argv, &runtime).await;
                    if stream.write_all(&reply.to_bytes()).await.is_err() {
                        return;
                    }
                }
                Ok(ParseOutcome::NeedMore) => break,
                Err(e) => {
                    tracing::warn!(%addr, %e, "malformed peer command");
                    return;
                }
            }
        }
    }
}

async fn dispatch_peer_command(argv: &[Vec<u8>], runtime: &Arc<RwLock<Runtime>>) -> Reply {
    let name = String::from_utf8_lossy(&argv[0]).to_ascii_uppercase();
    match name.as_str() {
        "PING" => Reply::Simple("PONG".into()),
        "INFO" => Reply::from_string("# Sentinel\r\nrole:sentinel\r\n"),
        "SENTINEL" if argv.len() >= 6 && argv[1].eq_ignore_ascii_case(b"is-master-down-by-addr") => {
            let master_ip = String::from_utf8_lossy(&argv[2]).to_string();
            let master_port: u16 = String::from_utf8_lossy(&argv[3]).parse().unwrap_or(0);
            let epoch: u64 = String::from_utf8_lossy(&argv[4]).parse().unwrap_or(0);
            let candidate_run_id = String::from_utf8_lossy(&argv[5]).to_string();

            let mut rt = runtime.write().await;
            let master_name =
                rt.state.masters.values().find(|m| m.ip == master_ip && m.port == master_port).map(|m| m.name.clone());
            let Some(master_name) = master_name else {
                return Reply::Array(vec![Reply::Integer(0), Reply::from_string("*"), Reply::Integer(0)]);
            };
            let locally_down = rt.state.masters.get(&master_name).map(|m| m.is_sdown(now_ms())).unwrap_or(false);
            let outcome = rt.election.handle_vote_request(&master_name, epoch, &candidate_run_id);
            let (leader, leader_epoch) = match outcome {
                VoteOutcome::Granted => (candidate_run_id, epoch),
                VoteOutcome::AlreadyLeader { run_id } => (run_id, epoch),
                VoteOutcome::Rejected => (String::new(), rt.election.current_epoch),
            };
            Reply::Array(vec![
                Reply::Integer(if locally_down { 1 } else { 0 }),
                Reply::from_string(leader),
                Reply::Integer(leader_epoch as i64),
            ])
        }
        _ => Reply::from(alice::error::RedisError::UnknownCommand(name)),
    }
}
