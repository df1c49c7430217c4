//! Message-framed connections.
//!
//! A connection is a bidirectional byte stream framed into messages by
//! a single terminator byte chosen at construction (`|` for the legacy
//! protocol, `\n` for the ADC protocol). Outbound sends append the
//! terminator implicitly. The owner receives whole messages on an event
//! channel, can switch the next N inbound bytes into raw delivery for
//! block transfers, and can stream a file region into the socket with
//! the kernel fast path where available.
//!
//! All socket work runs on one task per connection, in event-loop
//! style: reads, queued writes and the 5-second idle timer interleave
//! at readiness boundaries, so a long file send never starves inbound
//! traffic.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use dctide_hash::RateCalc;

use crate::error::NetError;
use crate::stats::NetStats;

/// Input buffer cap; a message larger than this is a fatal framing
/// error.
const MAX_INBUF: usize = 1 << 20;

/// Idle-check period.
const TIMER_PERIOD: Duration = Duration::from_secs(5);

/// Keepalive threshold when enabled.
const KEEPALIVE_AFTER: Duration = Duration::from_secs(120);

/// Idle timeout when keepalive is disabled.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// File-send chunk size for the read+write fallback.
const FILE_CHUNK: usize = 64 * 1024;

/// Construction-time connection parameters.
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Message terminator byte
    pub terminator: u8,
    /// Send empty frames instead of timing out when idle
    pub keepalive: bool,
    /// The collaborator wraps this stream in TLS
    pub tls: bool,
}

impl ConnConfig {
    /// ADC-style configuration: `\n` terminator.
    #[must_use]
    pub fn adc(tls: bool) -> Self {
        ConnConfig {
            terminator: b'\n',
            keepalive: false,
            tls,
        }
    }

    /// Legacy-protocol configuration: `|` terminator.
    #[must_use]
    pub fn nmdc(tls: bool) -> Self {
        ConnConfig {
            terminator: b'|',
            keepalive: false,
            tls,
        }
    }
}

/// Events delivered to the connection owner, in order.
#[derive(Debug)]
pub enum ConnEvent {
    /// Outbound connect completed
    Connected {
        /// Local address of the socket
        local: SocketAddr,
    },
    /// One whole framed message, terminator stripped
    Message(Vec<u8>),
    /// A chunk of a raw-receive range
    RawData(Vec<u8>),
    /// Transport failure; the owner should disconnect
    Error(NetError),
}

enum Cmd {
    /// Already-terminated bytes to queue
    Send(Vec<u8>),
    /// Stream a file region into the socket
    SendFile {
        path: PathBuf,
        offset: u64,
        length: u64,
    },
    /// Deliver the next `n` inbound bytes unframed
    ReceiveRaw(u64),
}

struct Shared {
    last_io: Mutex<Instant>,
    down: Mutex<RateCalc>,
    up: Mutex<RateCalc>,
    stats: Arc<NetStats>,
}

impl Shared {
    fn new(stats: Arc<NetStats>) -> Self {
        Shared {
            last_io: Mutex::new(Instant::now()),
            down: Mutex::new(RateCalc::new()),
            up: Mutex::new(RateCalc::new()),
            stats,
        }
    }

    fn on_read(&self, n: u64) {
        *self.last_io.lock().expect("lock") = Instant::now();
        self.down.lock().expect("lock").add(n);
        self.stats.add_rx(n);
    }

    fn on_write(&self, n: u64) {
        *self.last_io.lock().expect("lock") = Instant::now();
        self.up.lock().expect("lock").add(n);
        self.stats.add_tx(n);
    }

    fn idle(&self) -> Duration {
        self.last_io.lock().expect("lock").elapsed()
    }
}

/// Owner-side handle of a connection.
///
/// Dropping the handle tears the connection down; an in-flight connect
/// is cancelled without an error event.
pub struct Connection {
    cfg: ConnConfig,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Connection {
    /// Open an outbound connection.
    ///
    /// Returns immediately; the owner sees either `Connected` or
    /// `Error(Connect)` on the event channel.
    #[must_use]
    pub fn connect(
        addr: SocketAddr,
        cfg: ConnConfig,
        stats: Arc<NetStats>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Connection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(stats));
        let drive_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let stream = match TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = events.send(ConnEvent::Error(NetError::Connect(e.to_string())));
                    return;
                }
            };
            if let Ok(local) = stream.local_addr() {
                let _ = events.send(ConnEvent::Connected { local });
            }
            drive(stream, cfg, drive_shared, events, cmd_rx).await;
        });
        Connection {
            cfg,
            cmd_tx,
            shared,
            task,
        }
    }

    /// Adopt an accepted socket.
    #[must_use]
    pub fn accept(
        stream: TcpStream,
        cfg: ConnConfig,
        stats: Arc<NetStats>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Connection {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(stats));
        let drive_shared = Arc::clone(&shared);
        let task =
            tokio::spawn(async move { drive(stream, cfg, drive_shared, events, cmd_rx).await });
        Connection {
            cfg,
            cmd_tx,
            shared,
            task,
        }
    }

    /// Queue one framed message; the terminator is appended here.
    /// Returns immediately, completion timing is not observable.
    pub fn send(&self, msg: &[u8]) {
        let mut framed = Vec::with_capacity(msg.len() + 1);
        framed.extend_from_slice(msg);
        framed.push(self.cfg.terminator);
        let _ = self.cmd_tx.send(Cmd::Send(framed));
    }

    /// Stream `length` bytes of a file from `offset` into the socket,
    /// unframed.
    pub fn send_file(&self, path: PathBuf, offset: u64, length: u64) {
        let _ = self.cmd_tx.send(Cmd::SendFile {
            path,
            offset,
            length,
        });
    }

    /// Deliver the next `length` inbound bytes as `RawData` chunks,
    /// bypassing framing. Bytes already buffered are consumed first.
    pub fn receive_raw(&self, length: u64) {
        let _ = self.cmd_tx.send(Cmd::ReceiveRaw(length));
    }

    /// TLS flavor tag of this connection.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.cfg.tls
    }

    /// Current inbound rate, bytes per second.
    #[must_use]
    pub fn recv_rate(&self) -> u64 {
        self.shared.down.lock().expect("lock").rate()
    }

    /// Current outbound rate, bytes per second.
    #[must_use]
    pub fn send_rate(&self) -> u64 {
        self.shared.up.lock().expect("lock").rate()
    }

    /// Tear the connection down. Idempotent; suppresses any pending
    /// connect error.
    pub fn disconnect(&self) {
        self.task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum WriteJob {
    Buf {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        file: std::fs::File,
        offset: u64,
        remaining: u64,
        fallback: bool,
        buf: Vec<u8>,
        buf_pos: usize,
    },
}

/// What the idle timer decided.
#[derive(Debug, PartialEq, Eq)]
enum IdleAction {
    None,
    Keepalive,
    Timeout,
}

fn idle_action(keepalive: bool, idle: Duration) -> IdleAction {
    if keepalive {
        if idle >= KEEPALIVE_AFTER {
            IdleAction::Keepalive
        } else {
            IdleAction::None
        }
    } else if idle > IDLE_TIMEOUT {
        IdleAction::Timeout
    } else {
        IdleAction::None
    }
}

async fn drive(
    stream: TcpStream,
    cfg: ConnConfig,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
) {
    let mut inbuf: Vec<u8> = Vec::new();
    let mut raw_remaining: u64 = 0;
    let mut write_queue: VecDeque<WriteJob> = VecDeque::new();
    let mut timer = tokio::time::interval(TIMER_PERIOD);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut scratch = vec![0u8; 64 * 1024];

    let fatal = |events: &mpsc::UnboundedSender<ConnEvent>, e: NetError| {
        let _ = events.send(ConnEvent::Error(e));
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    // Handle dropped; drop the socket with it.
                    return;
                };
                match cmd {
                    Cmd::Send(data) => write_queue.push_back(WriteJob::Buf { data, pos: 0 }),
                    Cmd::SendFile { path, offset, length } => {
                        match open_at(&path, offset) {
                            Ok(file) => write_queue.push_back(WriteJob::File {
                                file,
                                offset,
                                remaining: length,
                                fallback: false,
                                buf: Vec::new(),
                                buf_pos: 0,
                            }),
                            Err(e) => {
                                fatal(&events, NetError::Send(e.to_string()));
                                return;
                            }
                        }
                    }
                    Cmd::ReceiveRaw(n) => {
                        raw_remaining = n;
                        if deliver(&events, &mut inbuf, &mut raw_remaining, cfg.terminator).is_err() {
                            fatal(&events, NetError::Receive("input buffer overflow".into()));
                            return;
                        }
                    }
                }
            }

            ready = stream.ready(Interest::READABLE), if write_queue.is_empty() => {
                if let Err(e) = ready {
                    fatal(&events, NetError::Receive(e.to_string()));
                    return;
                }
                match read_some(&stream, &shared, &mut scratch, &mut inbuf) {
                    Ok(true) => {}
                    Ok(false) => continue, // spurious readiness
                    Err(e) => {
                        fatal(&events, NetError::Receive(e));
                        return;
                    }
                }
                if deliver(&events, &mut inbuf, &mut raw_remaining, cfg.terminator).is_err() {
                    fatal(&events, NetError::Receive("input buffer overflow".into()));
                    return;
                }
            }

            ready = stream.ready(Interest::READABLE | Interest::WRITABLE), if !write_queue.is_empty() => {
                let ready = match ready {
                    Ok(r) => r,
                    Err(e) => {
                        fatal(&events, NetError::Send(e.to_string()));
                        return;
                    }
                };
                if ready.is_readable() {
                    match read_some(&stream, &shared, &mut scratch, &mut inbuf) {
                        Ok(_) => {
                            if deliver(&events, &mut inbuf, &mut raw_remaining, cfg.terminator)
                                .is_err()
                            {
                                fatal(&events, NetError::Receive("input buffer overflow".into()));
                                return;
                            }
                        }
                        Err(e) => {
                            fatal(&events, NetError::Receive(e));
                            return;
                        }
                    }
                }
                if ready.is_writable() {
                    if let Some(job) = write_queue.front_mut() {
                        match progress_write(&stream, &shared, job) {
                            Ok(true) => {
                                write_queue.pop_front();
                            }
                            Ok(false) => {}
                            Err(e) => {
                                fatal(&events, NetError::Send(e));
                                return;
                            }
                        }
                    }
                }
            }

            _ = timer.tick() => {
                match idle_action(cfg.keepalive, shared.idle()) {
                    IdleAction::None => {}
                    IdleAction::Keepalive => {
                        trace!("sending keepalive frame");
                        write_queue.push_back(WriteJob::Buf {
                            data: vec![cfg.terminator],
                            pos: 0,
                        });
                    }
                    IdleAction::Timeout => {
                        fatal(&events, NetError::Receive("idle timeout".into()));
                        return;
                    }
                }
            }
        }
    }
}

fn open_at(path: &std::path::Path, offset: u64) -> std::io::Result<std::fs::File> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(file)
}

/// One non-blocking read. `Ok(true)` when bytes arrived, `Ok(false)` on
/// spurious readiness.
fn read_some(
    stream: &TcpStream,
    shared: &Shared,
    scratch: &mut [u8],
    inbuf: &mut Vec<u8>,
) -> Result<bool, String> {
    match stream.try_read(scratch) {
        Ok(0) => Err("remote closed the connection".into()),
        Ok(n) => {
            shared.on_read(n as u64);
            inbuf.extend_from_slice(&scratch[..n]);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e.to_string()),
    }
}

/// Drain the input buffer into raw chunks and framed messages.
/// Errors only on framing overflow.
fn deliver(
    events: &mpsc::UnboundedSender<ConnEvent>,
    inbuf: &mut Vec<u8>,
    raw_remaining: &mut u64,
    terminator: u8,
) -> Result<(), ()> {
    loop {
        if *raw_remaining > 0 {
            if inbuf.is_empty() {
                return Ok(());
            }
            let take = (*raw_remaining).min(inbuf.len() as u64) as usize;
            let chunk: Vec<u8> = inbuf.drain(..take).collect();
            *raw_remaining -= chunk.len() as u64;
            let _ = events.send(ConnEvent::RawData(chunk));
            continue;
        }
        match inbuf.iter().position(|&b| b == terminator) {
            Some(idx) => {
                let msg: Vec<u8> = inbuf.drain(..=idx).take(idx).collect();
                let _ = events.send(ConnEvent::Message(msg));
            }
            None => {
                if inbuf.len() > MAX_INBUF {
                    return Err(());
                }
                return Ok(());
            }
        }
    }
}

/// Advance the front write job by one readiness round.
/// `Ok(true)` when the job completed.
fn progress_write(stream: &TcpStream, shared: &Shared, job: &mut WriteJob) -> Result<bool, String> {
    match job {
        WriteJob::Buf { data, pos } => {
            match stream.try_write(&data[*pos..]) {
                Ok(n) => {
                    shared.on_write(n as u64);
                    *pos += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.to_string()),
            }
            Ok(*pos == data.len())
        }
        WriteJob::File {
            file,
            offset,
            remaining,
            fallback,
            buf,
            buf_pos,
        } => {
            if *remaining == 0 && buf[*buf_pos..].is_empty() {
                return Ok(true);
            }

            #[cfg(target_os = "linux")]
            if !*fallback {
                match sendfile_step(stream, file, *offset, *remaining) {
                    Ok(0) => return Err("file shorter than requested range".into()),
                    Ok(n) => {
                        shared.on_write(n as u64);
                        *offset += n as u64;
                        *remaining -= (n as u64).min(*remaining);
                        return Ok(*remaining == 0);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if is_sendfile_unsupported(&e) => {
                        debug!("sendfile unsupported here, using read+write: {e}");
                        *fallback = true;
                        if let Err(e) = file.seek(SeekFrom::Start(*offset)) {
                            return Err(e.to_string());
                        }
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
            #[cfg(not(target_os = "linux"))]
            {
                *fallback = true;
            }

            // Read+write fallback: refill the chunk buffer, then push
            // what the socket accepts.
            if buf[*buf_pos..].is_empty() {
                let want = FILE_CHUNK.min(*remaining as usize);
                buf.resize(want, 0);
                *buf_pos = 0;
                let n = file.read(buf).map_err(|e| e.to_string())?;
                if n == 0 {
                    return Err("file shorter than requested range".into());
                }
                buf.truncate(n);
                *offset += n as u64;
                *remaining -= n as u64;
            }
            match stream.try_write(&buf[*buf_pos..]) {
                Ok(n) => {
                    shared.on_write(n as u64);
                    *buf_pos += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.to_string()),
            }
            Ok(*remaining == 0 && buf[*buf_pos..].is_empty())
        }
    }
}

#[cfg(target_os = "linux")]
fn is_sendfile_unsupported(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINVAL | libc::ENOSYS | libc::EOPNOTSUPP)
    )
}

#[cfg(target_os = "linux")]
fn sendfile_step(
    stream: &TcpStream,
    file: &std::fs::File,
    offset: u64,
    remaining: u64,
) -> std::io::Result<usize> {
    use std::os::fd::AsRawFd;
    stream.try_io(Interest::WRITABLE, || {
        let mut off = offset as libc::off_t;
        let count = remaining.min(1 << 20) as usize;
        let n = unsafe {
            libc::sendfile(stream.as_raw_fd(), file.as_raw_fd(), &mut off, count)
        };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    })
}
