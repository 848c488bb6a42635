//! Networking and the event loop (§5 Concurrency & resource model). One
//! task owns the `Engine` and is the only thing that ever touches it;
//! every connection gets its own read task that frames bytes off the
//! socket and forwards decoded requests through a channel, plus a write
//! task draining the `Conn`'s outbound queue. Grounded in the
//! accept-task / event-handler-task split of the teacher's `main.rs` and
//! `event.rs`, generalized so the owning task is the `Engine` itself
//! rather than an `Arc<RwLock<HashMap>>` the handlers reach into.

use crate::engine::{Engine, REPLICA_CONN_ID};
use crate::protocol::{encode_request, parse_request, ParseOutcome};
use crate::replication::{SlaveHandshake, SlaveLink};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// Everything a connection task, the tick task, or a replication task can
/// ask of the owning engine task. The engine itself is never shared behind
/// a lock; every interaction goes through this channel (§9 Design notes).
pub enum EngineMessage {
    Connect { outbound: mpsc::UnboundedSender<Vec<u8>>, reply_to: oneshot::Sender<u64> },
    Request { conn_id: u64, argv: Vec<Vec<u8>> },
    Disconnect { conn_id: u64 },
    Tick,
    /// A write streamed down from this server's own master (§4.7).
    ReplicatedCommand { argv: Vec<Vec<u8>> },
    /// The RDB body a `FULLRESYNC` handed the slave-side link.
    ReplicatedSnapshot { bytes: Vec<u8> },
    /// SIGINT: persist, then stop the engine loop (§6 CLI surface).
    Shutdown,
}

/// Bind, accept connections, and run until `Engine::shutting_down` is
/// observed. `engine` should already have its snapshot/AOF state loaded.
pub async fn run(engine: Engine) -> anyhow::Result<()> {
    let ip = engine.config.get_string("ip", "127.0.0.1");
    let port = engine.config.get_u64("port", 6379) as u16;
    let listen_addr = format!("{ip}:{port}");
    let replica_of = engine.slave_link.as_ref().map(|l| (l.master_host.clone(), l.master_port));

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "listening");

    let (tx, rx) = mpsc::unbounded_channel();
    let engine_task = tokio::spawn(run_engine(engine, rx));

    let tx_accept = tx.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx_accept.clone();
                    tokio::spawn(handle_connection(stream, addr, tx));
                }
                Err(e) => tracing::warn!(%e, "accept failed"),
            }
        }
    });

    let tx_tick = tx.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(100));
        loop {
            interval.tick().await;
            if tx_tick.send(EngineMessage::Tick).is_err() {
                break;
            }
        }
    });

    if let Some((host, master_port)) = replica_of {
        let tx_repl = tx.clone();
        tokio::spawn(async move { run_replica_link(host, master_port, port, tx_repl).await });
    }

    let tx_sigint = tx.clone();
    let sigint_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, persisting before shutdown");
            let _ = tx_sigint.send(EngineMessage::Shutdown);
        }
    });

    let result = tokio::select! {
        res = engine_task => res.map_err(anyhow::Error::from),
        res = accept_task => res.map_err(anyhow::Error::from),
    };
    sigint_task.abort();
    tick_task.abort();
    result
}

/// The sole owner of `Engine`. Every other task only ever reaches it
/// through `rx`; this loop is the serialization point the whole model
/// relies on (§5: single-threaded cooperative dataflow).
async fn run_engine(mut engine: Engine, mut rx: mpsc::UnboundedReceiver<EngineMessage>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            EngineMessage::Connect { outbound, reply_to } => {
                let id = engine.register_conn(outbound);
                let _ = reply_to.send(id);
            }
            EngineMessage::Disconnect { conn_id } => engine.drop_conn(conn_id),
            EngineMessage::Request { conn_id, argv } => {
                let (bytes, wakeups) = engine.dispatch(conn_id, argv);
                if !bytes.is_empty() {
                    if let Some(conn) = engine.conns.get(&conn_id) {
                        conn.send(bytes);
                    }
                }
                send_wakeups(&engine, wakeups);
            }
            EngineMessage::Tick => {
                let wakeups = engine.tick();
                send_wakeups(&engine, wakeups);
                if engine.shutting_down {
                    tracing::info!("shutdown requested, stopping engine loop");
                    break;
                }
            }
            EngineMessage::ReplicatedCommand { argv } => {
                let (_, wakeups) = engine.dispatch(REPLICA_CONN_ID, argv);
                send_wakeups(&engine, wakeups);
            }
            EngineMessage::ReplicatedSnapshot { bytes } => {
                if let Err(e) = engine.load_snapshot_bytes(&bytes) {
                    tracing::warn!(%e, "failed to apply snapshot from master");
                }
            }
            EngineMessage::Shutdown => {
                engine.shutdown_persist();
                tracing::info!("persisted state, stopping engine loop");
                break;
            }
        }
    }
}

fn send_wakeups(engine: &Engine, wakeups: Vec<crate::engine::Wakeup>) {
    for wakeup in wakeups {
        if let Some(conn) = engine.conns.get(&wakeup.conn_id) {
            conn.send(wakeup.reply.to_bytes());
        }
    }
}

/// One client socket: a read half that only frames bytes and forwards
/// decoded argvs, and a write half drained from the `Conn`'s outbound
/// channel. Neither half ever looks at database state directly.
async fn handle_connection(stream: TcpStream, addr: SocketAddr, engine_tx: mpsc::UnboundedSender<EngineMessage>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let (reply_tx, reply_rx) = oneshot::channel();
    if engine_tx.send(EngineMessage::Connect { outbound: out_tx, reply_to: reply_tx }).is_err() {
        return;
    }
    let Ok(conn_id) = reply_rx.await else { return };
    tracing::debug!(%addr, conn_id, "client connected");

    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = Vec::with_capacity(4096);
    let mut scratch = [0u8; 4096];
    'read_loop: loop {
        match reader.read(&mut scratch).await {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(_) => break,
        }
        loop {
            match parse_request(&buf) {
                Ok(ParseOutcome::Complete { consumed, argv }) => {
                    buf.drain(..consumed);
                    if argv.is_empty() {
                        continue;
                    }
                    if engine_tx.send(EngineMessage::Request { conn_id, argv }).is_err() {
                        break 'read_loop;
                    }
                }
                Ok(ParseOutcome::NeedMore) => break,
                Err(e) => {
                    tracing::warn!(%addr, %e, "protocol error, closing connection");
                    break 'read_loop;
                }
            }
        }
    }

    let _ = engine_tx.send(EngineMessage::Disconnect { conn_id });
    tracing::debug!(%addr, conn_id, "client disconnected");
    // The write task exits on its own once the engine drops this
    // connection's `Conn` (and with it its outbound sender).
}

/// Slave-side replication client (§4.7 Roles): drives the
/// `SlaveHandshake` state machine against one master, retrying the whole
/// handshake on any failure.
async fn run_replica_link(host: String, master_port: u16, own_port: u16, engine_tx: mpsc::UnboundedSender<EngineMessage>) {
    loop {
        match sync_with_master(&host, master_port, own_port, &engine_tx).await {
            Ok(()) => tracing::info!(master = %host, "replication link closed, retrying"),
            Err(e) => tracing::warn!(master = %host, %e, "replication link failed, retrying"),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn sync_with_master(
    host: &str,
    port: u16,
    own_port: u16,
    engine_tx: &mpsc::UnboundedSender<EngineMessage>,
) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect((host, port)).await?;
    let mut buf = Vec::new();
    let mut link = SlaveLink::new(host.to_string(), port);

    stream.write_all(&encode_request(&[b"PING".to_vec()])).await?;
    read_line(&mut stream, &mut buf).await?;
    link.handshake = link.handshake.advance(); // SyncConf

    stream
        .write_all(&encode_request(&[b"REPLCONF".to_vec(), b"listening-port".to_vec(), own_port.to_string().into_bytes()]))
        .await?;
    read_line(&mut stream, &mut buf).await?;
    link.handshake = link.handshake.advance(); // SyncWait

    stream.write_all(&encode_request(&link.psync_request())).await?;
    link.handshake = link.handshake.advance(); // SyncFull

    let resync_line = read_line(&mut stream, &mut buf).await?;
    if let Some(rest) = resync_line.strip_prefix("+FULLRESYNC ") {
        let mut parts = rest.split_whitespace();
        link.master_run_id = parts.next().map(|s| s.to_string());
        link.slave_offset = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let snapshot = read_bulk_payload(&mut stream, &mut buf).await?;
        let _ = engine_tx.send(EngineMessage::ReplicatedSnapshot { bytes: snapshot });
    }
    link.handshake = link.handshake.advance(); // Streaming
    debug_assert_eq!(link.handshake, SlaveHandshake::Streaming);
    tracing::info!(master = %host, "replication handshake complete, streaming");

    let mut scratch = [0u8; 4096];
    // §4.7 Heartbeats: ack the applied offset on a timer so the master can
    // tell a lagging/disconnected slave apart from one that's caught up.
    let mut ack_interval = tokio::time::interval(Duration::from_secs(1));
    ack_interval.tick().await; // first tick fires immediately

    loop {
        loop {
            match parse_request(&buf) {
                Ok(ParseOutcome::Complete { consumed, argv }) => {
                    buf.drain(..consumed);
                    link.on_streamed_bytes(consumed);
                    if argv.is_empty() || argv[0].eq_ignore_ascii_case(b"PING") {
                        continue;
                    }
                    let _ = engine_tx.send(EngineMessage::ReplicatedCommand { argv });
                }
                Ok(ParseOutcome::NeedMore) => break,
                Err(e) => anyhow::bail!("bad command from master: {e}"),
            }
        }
        tokio::select! {
            res = stream.read(&mut scratch) => {
                let n = res?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&scratch[..n]);
            }
            _ = ack_interval.tick() => {
                let ack = [b"REPLCONF".to_vec(), b"ACK".to_vec(), link.slave_offset.to_string().into_bytes()];
                stream.write_all(&encode_request(&ack)).await?;
            }
        }
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<()> {
    let mut scratch = [0u8; 4096];
    let n = stream.read(&mut scratch).await?;
    if n == 0 {
        anyhow::bail!("connection closed by master");
    }
    buf.extend_from_slice(&scratch[..n]);
    Ok(())
}

/// Read one `\r\n`-terminated status line, draining it (and the
/// terminator) from `buf`.
async fn read_line(stream: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<String> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..pos]).into_owned();
            buf.drain(..pos + 2);
            return Ok(line);
        }
        read_more(stream, buf).await?;
    }
}

/// Read the snapshot body following `+FULLRESYNC`: a bare `$<len>\r\n`
/// header plus `len` raw bytes with no trailing CRLF, since it carries an
/// RDB image rather than an ordinary bulk string (§4.7 Full resync).
async fn read_bulk_payload(stream: &mut TcpStream, buf: &mut Vec<u8>) -> anyhow::Result<Vec<u8>> {
    let header = read_line(stream, buf).await?;
    let len: usize = header
        .strip_prefix('$')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed snapshot header {header:?}"))?;
    while buf.len() < len {
        read_more(stream, buf).await?;
    }
    let payload = buf[..len].to_vec();
    buf.drain(..len);
    Ok(payload)
}
