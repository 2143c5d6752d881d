//! The connection/message-dispatch runtime (§4.3): a reusable, non-blocking,
//! single-threaded connection object with line-framed, command-multiplexed
//! messaging, an idle timeout, graceful "connection moved" handover, and a
//! pluggable, sorted command table.
//!
//! Realized on top of Tokio: "non-blocking" becomes "cooperative `.await`",
//! and the original's explicit reactor registration (`ev_io_start`,
//! `ev_timer_again`, ...) becomes recomputing the wanted interest
//! (`want_read`/`want_write`) fresh on every loop iteration and racing it
//! against the idle timer with `tokio::select!`.

use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::buffer::NBuf;
use crate::error::{ConnError, CtlError};

/// Default control-frame marker (`%`), per §6.
pub const DEFAULT_CTL_CHAR: u8 = b'%';

/// One parsed control request: `<marker><name> <tid-hex> [args…]`.
pub struct CtlRequest<'a> {
    pub name: &'a str,
    pub tid: u64,
    pub args: &'a str,
}

/// A named control handler. `State` is whatever shared, single-threaded
/// state the owning binary's connections dispatch against (an aggregator's
/// registries, for instance).
pub type CtlHandler<State> = fn(&mut State, &CtlRequest) -> Result<(), CtlError>;

/// One entry of a connection's control table. Tables are `&'static [CtlEntry]`
/// and MUST be sorted by `name` — dispatch uses binary search, mirroring the
/// original's `bsearch` over `cc_ctl`.
#[derive(Clone, Copy)]
pub struct CtlEntry<State> {
    pub name: &'static str,
    pub handler: CtlHandler<State>,
}

/// Non-control frames are passed to this callback if installed (§4.3);
/// otherwise they are silently discarded. Returning an error ends the
/// connection, matching the original's treatment of `cc_msg_cb`'s return
/// value as an ordinary I/O error.
pub type MsgHandler<State> = fn(&mut State, &[u8]) -> Result<(), ConnError>;

/// Immutable per-connection-type configuration, shared (via `Rc`) across
/// every connection of a given kind.
pub struct ConnOps<State> {
    pub rd_buf_size: usize,
    pub wr_buf_size: usize,
    pub timeout: Duration,
    pub ctl_char: u8,
    pub ctl_table: &'static [CtlEntry<State>],
    pub msg_cb: Option<MsgHandler<State>>,
}

impl<State> ConnOps<State> {
    /// Debug-asserts the control table invariant dispatch relies on: sorted,
    /// unique names. Call this once at startup, not per connection.
    pub fn assert_ctl_table_sorted(&self) {
        debug_assert!(
            self.ctl_table.windows(2).all(|w| w[0].name < w[1].name),
            "control table must be sorted by name with no duplicates"
        );
    }
}

fn dispatch<'t, State>(
    table: &'t [CtlEntry<State>],
    name: &str,
) -> Option<&'t CtlEntry<State>> {
    table
        .binary_search_by(|e| e.name.cmp(name))
        .ok()
        .map(|i| &table[i])
}

/// Parses `<name> <tid-hex> [args…]` (the control-char prefix already
/// stripped). Matching the original's `split(&msg, &name, &tid, NULL) != 2`
/// check, at least a name and a tid token are required; anything after is
/// passed through verbatim as `args`.
fn parse_ctl(rest: &str) -> Result<(&str, u64, &str), CtlError> {
    let rest = rest.trim_end_matches(['\r']);
    let mut parts = rest.splitn(3, ' ');
    let name = parts.next().filter(|s| !s.is_empty()).ok_or(CtlError::NrArgs)?;
    let tid_hex = parts.next().ok_or(CtlError::NrArgs)?;
    let args = parts.next().unwrap_or("");

    let tid = u64::from_str_radix(tid_hex, 16).map_err(|_| CtlError::NrArgs)?;

    Ok((name, tid, args))
}

fn push_reply(pending: &mut Vec<u8>, ctl_char: u8, name: &str, tid: u64, err: Option<CtlError>) {
    let (code, msg): (i32, String) = match err {
        None => (0, "success".to_string()),
        Some(e) => (e.code(), e.to_string()),
    };
    let line = format!("{}{} {:x} {} {}\n", ctl_char as char, name, tid, code, msg);
    pending.extend_from_slice(line.as_bytes());
}

fn handle_ctl_frame<State>(
    rest: &str,
    pending_replies: &mut Vec<u8>,
    lifecycle_end: &mut Option<CtlError>,
    ops: &ConnOps<State>,
    state: &mut State,
    conn_name: &str,
) {
    let (name, tid, args) = match parse_ctl(rest) {
        Ok(v) => v,
        Err(e) => {
            push_reply(pending_replies, ops.ctl_char, "NONE", 0, Some(e));
            return;
        }
    };

    let result = match dispatch(ops.ctl_table, name) {
        Some(entry) => {
            let req = CtlRequest { name, tid, args };
            (entry.handler)(state, &req)
        }
        None => {
            tracing::debug!(conn = %conn_name, %name, "no control handler registered");
            Err(CtlError::NoCtl)
        }
    };

    match result {
        Ok(()) => push_reply(pending_replies, ops.ctl_char, name, tid, None),
        Err(e) if e.is_lifecycle_marker() => *lifecycle_end = Some(e),
        Err(e) => {
            tracing::debug!(conn = %conn_name, %name, error = %e, "control error");
            push_reply(pending_replies, ops.ctl_char, name, tid, Some(e));
        }
    }
}

/// Drains every complete frame currently buffered, dispatching control
/// frames and handing data frames to `ops.msg_cb`. Stops early if a
/// lifecycle marker was set. Takes explicit field references rather than
/// `&mut Connection` so it can be called from inside a `run_loop` `select!`
/// arm without reborrowing fields the other arm already holds.
fn drain_frames<State>(
    rd_buf: &mut NBuf,
    pending_replies: &mut Vec<u8>,
    lifecycle_end: &mut Option<CtlError>,
    ops: &ConnOps<State>,
    state: &mut State,
    conn_name: &str,
) -> Result<(), ConnError> {
    while lifecycle_end.is_none() {
        let Some(frame) = rd_buf.get_msg() else {
            break;
        };

        if frame.first() == Some(&ops.ctl_char) {
            let rest = String::from_utf8_lossy(&frame[1..]).into_owned();
            handle_ctl_frame(&rest, pending_replies, lifecycle_end, ops, state, conn_name);
        } else if let Some(cb) = ops.msg_cb {
            cb(state, &frame)?;
        }
    }
    Ok(())
}

struct ConnHalves<IO> {
    rh: ReadHalf<IO>,
    wh: WriteHalf<IO>,
}

/// How a connection's run loop concluded.
#[derive(Debug)]
pub enum ConnOutcome {
    /// Ended normally: EOF seen and nothing left to write, or a handler
    /// returned the `Ended` lifecycle marker.
    Ended,
    /// A handler returned the `Moved` lifecycle marker; the caller is
    /// expected to have already performed the handover via
    /// [`Connection::move_into`] before returning it.
    Moved,
    /// A transport-level or protocol-fatal error ended the connection.
    Error(ConnError),
}

/// The connection runtime itself: one stream, a read buffer, a write
/// buffer, an idle timeout, and a dispatch table (§4.3).
pub struct Connection<IO, State> {
    io: Option<ConnHalves<IO>>,
    rd_buf: NBuf,
    wr_buf: NBuf,
    /// Control replies generated while draining frames, staged here rather
    /// than written straight into `wr_buf`, so that the read and write arms
    /// of the run loop's `select!` touch disjoint fields (dispatch needs to
    /// run while `wr_buf` is already borrowed for an in-flight write).
    pending_replies: Vec<u8>,
    name: String,
    rd_eof: bool,
    lifecycle_end: Option<CtlError>,
    ops: Rc<ConnOps<State>>,
    pub state: State,
}

impl<IO, State> Connection<IO, State>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// `init` + `set` + `start` collapsed into one constructor: allocates
    /// buffers per `ops`, binds `io` under `name`, and arms the connection
    /// to run. There is no separate registration step to perform since
    /// Tokio registers interest lazily at poll time.
    pub fn new(io: IO, name: impl Into<String>, ops: Rc<ConnOps<State>>, state: State) -> Self {
        let rd_buf = NBuf::init(ops.rd_buf_size);
        let wr_buf = NBuf::init(ops.wr_buf_size);
        let (rh, wh) = split(io);

        Connection {
            io: Some(ConnHalves { rh, wh }),
            rd_buf,
            wr_buf,
            pending_replies: Vec::new(),
            name: name.into(),
            rd_eof: false,
            lifecycle_end: None,
            ops,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Formats a line into the write buffer, pulling up first. Fails with
    /// [`crate::buffer::NoBufferSpace`] if it doesn't fit even after
    /// pulling up; per §4.3 this never itself ends the connection — the
    /// caller decides whether a dropped write is fatal.
    pub fn writef(&mut self, line: impl AsRef<str>) -> Result<(), crate::buffer::NoBufferSpace> {
        self.wr_buf.push(line.as_ref().as_bytes())
    }

    async fn run_loop(&mut self) -> ConnOutcome {
        loop {
            if let Some(marker) = self.lifecycle_end.take() {
                return match marker {
                    CtlError::Moved => ConnOutcome::Moved,
                    _ => ConnOutcome::Ended,
                };
            }

            // Fold any replies staged by the previous iteration's dispatch
            // into `wr_buf` now, while nothing else has it borrowed.
            if !self.pending_replies.is_empty() {
                let staged = std::mem::take(&mut self.pending_replies);
                if self.wr_buf.push(&staged).is_err() {
                    tracing::warn!(conn = %self.name, "dropping control reply, no buffer space");
                }
            }

            let want_read = !self.rd_eof;
            let want_write = !self.wr_buf.is_empty();

            if !want_read && !want_write {
                return ConnOutcome::Ended;
            }

            let io = self.io.as_mut().expect("run() requires a bound connection");
            let rd_buf = &mut self.rd_buf;
            let wr_buf = &mut self.wr_buf;

            let sleep = tokio::time::sleep(self.ops.timeout);
            tokio::pin!(sleep);

            tokio::select! {
                biased;

                _ = &mut sleep => return ConnOutcome::Error(ConnError::TimedOut),

                r = rd_buf.fill(&mut io.rh), if want_read => {
                    match r {
                        Ok(eof) => {
                            if eof {
                                self.rd_eof = true;
                            }
                            let result = drain_frames(
                                rd_buf,
                                &mut self.pending_replies,
                                &mut self.lifecycle_end,
                                &self.ops,
                                &mut self.state,
                                &self.name,
                            );
                            if let Err(e) = result {
                                return ConnOutcome::Error(e);
                            }
                        }
                        Err(e) => return ConnOutcome::Error(ConnError::Io(e)),
                    }
                }

                w = write_pending(&mut io.wh, wr_buf), if want_write => {
                    if let Err(e) = w {
                        return ConnOutcome::Error(ConnError::Io(e));
                    }
                }
            }
        }
    }

    /// Runs the connection to completion: dispatches frames until the
    /// interest mask goes empty, a lifecycle marker fires, or a transport
    /// error occurs. On a transport error with no custom end handling, a
    /// best-effort `%error <code> <message>\n` frame is written before the
    /// connection closes (§4.3 End policy).
    pub async fn run(mut self) -> (State, ConnOutcome) {
        let outcome = self.run_loop().await;

        match &outcome {
            ConnOutcome::Error(e) => {
                tracing::warn!(conn = %self.name, error = %e, "ending connection");
                let line = format!("{}error {}\n", self.ops.ctl_char as char, e);
                let _ = self.wr_buf.push(line.as_bytes());
                if let Some(io) = self.io.as_mut() {
                    let _ = io.wh.write_all(self.wr_buf.peek()).await;
                }
            }
            ConnOutcome::Ended => tracing::info!(conn = %self.name, "connection ended"),
            ConnOutcome::Moved => tracing::info!(conn = %self.name, "connection moved"),
        }

        self.io = None;

        (self.state, outcome)
    }

    /// Transfers `src`'s buffers, descriptor, and name onto `dst`. `src` is
    /// left quiesced with no descriptor. Because `run()` recomputes its
    /// interest mask from the buffers on every iteration, a subsequent call
    /// to `dst.run()` picks up any data `src` had already buffered without
    /// needing a separate "wake" mechanism (§8 property 5).
    pub fn move_into(dst: &mut Self, src: &mut Self) {
        dst.io = src.io.take();
        NBuf::copy(&mut dst.rd_buf, &mut src.rd_buf);
        NBuf::copy(&mut dst.wr_buf, &mut src.wr_buf);
        dst.pending_replies.append(&mut src.pending_replies);
        dst.name = std::mem::take(&mut src.name);
        dst.rd_eof = src.rd_eof;
        src.rd_eof = false;
    }
}

async fn write_pending<W: AsyncWrite + Unpin>(
    w: &mut W,
    buf: &mut NBuf,
) -> std::io::Result<()> {
    let n = w.write(buf.peek()).await?;
    buf.consume(n);
    Ok(())
}

impl fmt::Display for ConnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnOutcome::Ended => write!(f, "ended"),
            ConnOutcome::Moved => write!(f, "moved"),
            ConnOutcome::Error(e) => write!(f, "error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;
    use tokio::io::{duplex, AsyncReadExt};

    #[derive(Default)]
    struct Counters {
        a: Vec<(u64, String)>,
        b: Vec<(u64, String)>,
    }

    fn h_a(c: &mut StdRc<RefCell<Counters>>, req: &CtlRequest) -> Result<(), CtlError> {
        c.borrow_mut().a.push((req.tid, req.args.to_string()));
        Ok(())
    }

    fn h_b(c: &mut StdRc<RefCell<Counters>>, req: &CtlRequest) -> Result<(), CtlError> {
        c.borrow_mut().b.push((req.tid, req.args.to_string()));
        Ok(())
    }

    const TABLE: &[CtlEntry<StdRc<RefCell<Counters>>>] = &[
        CtlEntry { name: "a", handler: h_a },
        CtlEntry { name: "b", handler: h_b },
        CtlEntry { name: "c", handler: h_a },
    ];

    fn test_ops() -> Rc<ConnOps<StdRc<RefCell<Counters>>>> {
        let ops = Rc::new(ConnOps {
            rd_buf_size: 256,
            wr_buf_size: 256,
            timeout: Duration::from_secs(5),
            ctl_char: DEFAULT_CTL_CHAR,
            ctl_table: TABLE,
            msg_cb: None,
        });
        ops.assert_ctl_table_sorted();
        ops
    }

    #[tokio::test]
    async fn dispatch_table_correctness() {
        let (client, server) = duplex(4096);
        let state = StdRc::new(RefCell::new(Counters::default()));
        let mut conn = Connection::new(server, "test", test_ops(), state.clone());

        let (mut reader, mut writer) = tokio::io::split(client);

        writer
            .write_all(b"%a 7f\n%b deadbeef x y\n%d 0\n")
            .await
            .unwrap();
        drop(writer);

        let outcome = conn.run_loop().await;
        assert!(matches!(outcome, ConnOutcome::Ended));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let out = String::from_utf8(out).unwrap();

        assert_eq!(state.borrow().a, vec![(0x7f, String::new())]);
        assert_eq!(
            state.borrow().b,
            vec![(0xdeadbeef, "x y".to_string())]
        );
        assert!(out.contains("%d 0 "), "reply was: {out}");
        assert!(out.contains("invalid operation"));
    }

    #[tokio::test]
    async fn writef_overflow_does_not_destroy_connection() {
        let (_client, server) = duplex(4096);
        let state = StdRc::new(RefCell::new(Counters::default()));
        let ops = Rc::new(ConnOps {
            rd_buf_size: 16,
            wr_buf_size: 8,
            timeout: Duration::from_secs(5),
            ctl_char: DEFAULT_CTL_CHAR,
            ctl_table: TABLE,
            msg_cb: None,
        });
        let mut conn = Connection::new(server, "test", ops, state);

        let oversized = "x".repeat(16);
        let err = conn.writef(&oversized).unwrap_err();
        assert_eq!(err, crate::buffer::NoBufferSpace);

        // The connection is still usable: a small write still succeeds.
        assert!(conn.writef("ok").is_ok());
    }

    #[tokio::test]
    async fn timeout_fires_within_bound() {
        let (_client, server) = duplex(64);
        let state = StdRc::new(RefCell::new(Counters::default()));
        let ops = Rc::new(ConnOps {
            rd_buf_size: 64,
            wr_buf_size: 64,
            timeout: Duration::from_millis(30),
            ctl_char: DEFAULT_CTL_CHAR,
            ctl_table: TABLE,
            msg_cb: None,
        });
        let conn = Connection::new(server, "test", ops, state);

        let started = tokio::time::Instant::now();
        let (_state, outcome) = conn.run().await;
        let elapsed = started.elapsed();

        assert!(matches!(outcome, ConnOutcome::Error(ConnError::TimedOut)));
        assert!(elapsed < Duration::from_millis(60));
    }

    #[tokio::test]
    async fn move_preserves_in_flight_write_data() {
        let (_client_a, server_a) = duplex(64);
        let (client_b, server_b) = duplex(64);

        let state = StdRc::new(RefCell::new(Counters::default()));
        let ops = test_ops();

        let mut src = Connection::new(server_a, "src", ops.clone(), state.clone());
        src.writef("hello\n").unwrap();

        let mut dst = Connection::new(server_b, "dst", ops, state);
        Connection::move_into(&mut dst, &mut src);

        assert!(src.io.is_none());

        let (mut reader, _writer) = tokio::io::split(client_b);

        // `Connection` carries `Rc`/`RefCell` state, so it is driven on a
        // `LocalSet` rather than via `tokio::spawn` (which requires `Send`).
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async move {
                tokio::task::spawn_local(async move {
                    let _ = dst.run_loop().await;
                });

                let mut buf = [0u8; 16];
                let n = tokio::time::timeout(Duration::from_millis(500), reader.read(&mut buf))
                    .await
                    .expect("timed out waiting for moved data")
                    .unwrap();

                assert_eq!(&buf[..n], b"hello\n");
            })
            .await;
    }
}
