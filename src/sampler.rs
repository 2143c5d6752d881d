//! Agent-side sample acquisition and push loop (§3.1, supplemented): a
//! `Sampler` trait the agent polls on an interval, and the EWMA/push
//! machinery that turns raw cumulative counters into `%sample` control
//! frames.
//!
//! Grounded on the wire contract in §6 plus `conn.rs`'s `Connection`
//! buffering discipline (`writef`/`NBuf`) — reused here as a
//! pattern, not by sharing a running `Connection`: the agent's push loop
//! only ever writes, so it drives its own small `NBuf`-backed flush rather
//! than the full read/write/dispatch runtime built for accepted/outbound
//! connections that also need to receive control replies.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::buffer::{NBuf, NoBufferSpace};
use crate::entity::EntityKind;
use crate::query::NR_STATS;

/// One raw, monotonically increasing counter reading for one `(x0, x1)`
/// entity pair. Acquisition (`/proc`, Lustre `obdfilter` stats, …) is out
/// of scope; this is the contract the push loop consumes.
#[derive(Debug, Clone)]
pub struct RawCounter {
    pub x0: (EntityKind, String),
    pub x1: (EntityKind, String),
    pub wr_bytes: u64,
    pub rd_bytes: u64,
    pub nr_reqs: u64,
}

pub trait Sampler {
    fn sample(&mut self) -> Vec<RawCounter>;
}

/// Returns the same fixed set of readings on every call.
pub struct StaticSampler {
    counters: Vec<RawCounter>,
}

impl StaticSampler {
    pub fn new(counters: Vec<RawCounter>) -> Self {
        StaticSampler { counters }
    }
}

impl Sampler for StaticSampler {
    fn sample(&mut self) -> Vec<RawCounter> {
        self.counters.clone()
    }
}

/// Produces no readings; used where a sampler is required but no local
/// acquisition target has been wired up yet.
pub struct NullSampler;

impl Sampler for NullSampler {
    fn sample(&mut self) -> Vec<RawCounter> {
        Vec::new()
    }
}

const EWMA_ALPHA: f64 = 0.5;

struct Prev {
    t: f64,
    cum: [f64; NR_STATS],
    rate: [f64; NR_STATS],
}

/// Tracks the previous cumulative reading and EWMA rate per entity pair, so
/// consecutive raw-counter samples turn into the `rate` values the wire
/// format carries (matching `k_rate`'s semantics).
#[derive(Default)]
pub struct AgentPushState {
    last: HashMap<(String, String), Prev>,
}

impl AgentPushState {
    pub fn new() -> Self {
        AgentPushState::default()
    }

    /// Folds one `(t, cumulative)` reading in, returning the updated EWMA
    /// rate. The first reading for a key has no prior delta to measure
    /// against and reports a zero rate.
    pub fn update(&mut self, key: (String, String), t: f64, cum: [f64; NR_STATS]) -> [f64; NR_STATS] {
        match self.last.get(&key) {
            None => {
                self.last.insert(key, Prev { t, cum, rate: [0.0; NR_STATS] });
                [0.0; NR_STATS]
            },
            Some(prev) => {
                let dt = (t - prev.t).max(f64::EPSILON);
                let mut rate = [0.0; NR_STATS];
                for i in 0..NR_STATS {
                    let instant = (cum[i] - prev.cum[i]).max(0.0) / dt;
                    rate[i] = EWMA_ALPHA * instant + (1.0 - EWMA_ALPHA) * prev.rate[i];
                }
                self.last.insert(key, Prev { t, cum, rate });
                rate
            },
        }
    }
}

/// A minimal, write-only `NBuf`-backed connection for the agent's push
/// loop; see the module doc comment for why this is not `conn::Connection`.
pub struct PushConn<W> {
    wr: W,
    buf: NBuf,
}

impl<W: AsyncWrite + Unpin> PushConn<W> {
    pub fn new(wr: W, wr_buf_size: usize) -> Self {
        PushConn {
            wr,
            buf: NBuf::init(wr_buf_size),
        }
    }

    pub fn writef(&mut self, line: impl AsRef<str>) -> Result<(), NoBufferSpace> {
        self.buf.push(line.as_ref().as_bytes())
    }

    /// Drains the write buffer to the underlying stream.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        while !self.buf.is_empty() {
            let n = self.wr.write(self.buf.peek()).await?;
            self.buf.consume(n);
        }
        Ok(())
    }
}

/// Formats and stages one `%sample` control frame for `counter`, updating
/// `push_state`'s EWMA rate tracking.
pub fn push_sample<W: AsyncWrite + Unpin>(
    conn: &mut PushConn<W>,
    push_state: &mut AgentPushState,
    tid: u64,
    t: f64,
    counter: &RawCounter,
) -> Result<(), NoBufferSpace> {
    let key = (
        format!("{}:{}", counter.x0.0, counter.x0.1),
        format!("{}:{}", counter.x1.0, counter.x1.1),
    );
    let cum = [counter.wr_bytes as f64, counter.rd_bytes as f64, counter.nr_reqs as f64];
    let rate = push_state.update(key, t, cum);

    let frame = format!(
        "%sample {:x} {}:{} {}:{} {} {} {} {}\n",
        tid, counter.x0.0, counter.x0.1, counter.x1.0, counter.x1.1, t, rate[0], rate[1], rate[2]
    );
    conn.writef(frame)
}

/// Drives the agent's push loop: on every `interval` tick, pulls readings
/// from `sampler`, stages a `%sample` frame per reading, and flushes.
pub async fn run_push_loop<S: Sampler, W: AsyncWrite + Unpin>(
    mut sampler: S,
    mut conn: PushConn<W>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut push_state = AgentPushState::new();
    let mut ticker = tokio::time::interval(interval);
    let start = std::time::Instant::now();
    let mut tid: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = cancel.cancelled() => return,
        }

        let t = start.elapsed().as_secs_f64();
        for counter in sampler.sample() {
            tid += 1;
            if let Err(error) = push_sample(&mut conn, &mut push_state, tid, t, &counter) {
                warn!(%error, "dropping sample push: write buffer full");
            }
        }

        if let Err(error) = conn.flush().await {
            warn!(%error, "agent push connection write failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{ingest_sample_args, AggregatorState};

    #[tokio::test]
    async fn static_sampler_push_produces_frame_the_aggregator_ingests() {
        let (agent_side, mut aggregator_side) = tokio::io::duplex(256);

        let counter = RawCounter {
            x0: (EntityKind::Job, "abc@c".to_string()),
            x1: (EntityKind::Fs, "tank".to_string()),
            wr_bytes: 1_048_576,
            rd_bytes: 0,
            nr_reqs: 4,
        };
        let sampler = StaticSampler::new(vec![counter]);
        let mut conn = PushConn::new(agent_side, 256);
        let mut push_state = AgentPushState::new();

        // First tick: no prior reading, rate reports zero.
        push_sample(&mut conn, &mut push_state, 1, 10.0, &sampler_only_counter(&sampler)).unwrap();
        conn.flush().await.unwrap();

        // Second tick, one second later: rate reflects the full delta.
        push_sample(&mut conn, &mut push_state, 2, 11.0, &sampler_only_counter(&sampler)).unwrap();
        conn.flush().await.unwrap();

        let mut received = vec![0u8; 512];
        let n = tokio::io::AsyncReadExt::read(&mut aggregator_side, &mut received).await.unwrap();
        let text = String::from_utf8(received[..n].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let mut state = AggregatorState::new();
        for line in &lines {
            let rest = line.strip_prefix("%sample ").expect("control frame marker");
            let (_tid, args) = rest.split_once(' ').unwrap();
            ingest_sample_args(&mut state, args).unwrap();
        }

        let q = crate::query::TopQuery {
            x0: (EntityKind::Job, "abc@c".to_string()),
            d0: 0,
            x1: (EntityKind::Fs, "tank".to_string()),
            d1: 0,
            limit: 1,
        };
        let rows = state.query(&q);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2.rate[0], 1_048_576.0);
    }

    fn sampler_only_counter(sampler: &StaticSampler) -> RawCounter {
        sampler.counters[0].clone()
    }
}
