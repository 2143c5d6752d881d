//! The aggregator-side Top-K Query Engine (§4.5): an `O(1)`-upsert map from
//! entity-pair identity to a sample record, queried by ranked, wildcard
//! top-K lookups, plus the query-string encoding (§6) and `%sample` control
//! frame grammar (§3.1) both sides of the wire share.
//!
//! Grounded on `struct xl_k` / `top_msg_cb` / `make_top_query` /
//! `query_escape` / `query_add` in `original_source/xltop.c`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::EntityKind;
use crate::error::CtlError;

/// The three stat kinds every sample carries pending/rate/sum values for.
pub const NR_STATS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    WrBytes,
    RdBytes,
    NrReqs,
}

impl StatKind {
    pub const ALL: [StatKind; NR_STATS] = [StatKind::WrBytes, StatKind::RdBytes, StatKind::NrReqs];

    pub fn index(self) -> usize {
        match self {
            StatKind::WrBytes => 0,
            StatKind::RdBytes => 1,
            StatKind::NrReqs => 2,
        }
    }
}

/// One axis's identity: an entity kind plus its name within that kind.
pub type AxisKey = (EntityKind, Arc<str>);

/// A cross-product sample: pending/rate/sum for one `(x0, x1)` pair, on the
/// wire in that order (§6's `/top` grammar).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub t: f64,
    pub pending: [f64; NR_STATS],
    pub rate: [f64; NR_STATS],
    pub sum: [f64; NR_STATS],
}

/// The parameters of a top-K query (§4.5, §6 query string).
#[derive(Debug, Clone)]
pub struct TopQuery {
    pub x0: (EntityKind, String),
    pub d0: i32,
    pub x1: (EntityKind, String),
    pub d1: i32,
    pub limit: usize,
}

/// The engine's state: a flat map keyed by entity-pair identity. Ingest is
/// `O(1)`; a query is a linear scan, filter, and stable partial sort.
#[derive(Default)]
pub struct AggregatorState {
    samples: HashMap<(AxisKey, AxisKey), Sample>,
}

impl AggregatorState {
    pub fn new() -> Self {
        AggregatorState::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Ingests one agent push: `rates` is taken as the agent's already
    /// EWMA-smoothed per-second rate, replacing the stored rate outright;
    /// `sum` accumulates monotonically across updates for the same pair.
    pub fn ingest_sample(&mut self, x0: AxisKey, x1: AxisKey, t: f64, rates: [f64; NR_STATS]) {
        let entry = self.samples.entry((x0, x1)).or_default();
        entry.t = t;
        for i in 0..NR_STATS {
            entry.sum[i] += rates[i];
            entry.rate[i] = rates[i];
        }
    }

    /// Returns the top `q.limit` records matching both axes, ranked by
    /// `rate[WR_BYTES] + rate[RD_BYTES]` descending. Ties keep the stable
    /// order `HashMap::iter` happens to yield this call, which is
    /// deterministic within one call but not across ingests — callers that
    /// need cross-call tie stability should break ties on a field of their
    /// own (e.g. entity name).
    pub fn query(&self, q: &TopQuery) -> Vec<(AxisKey, AxisKey, Sample)> {
        let mut rows: Vec<_> = self
            .samples
            .iter()
            .filter(|((k0, k1), _)| axis_matches(k0, &q.x0) && axis_matches(k1, &q.x1))
            .map(|((k0, k1), s)| (k0.clone(), k1.clone(), *s))
            .collect();

        rows.sort_by(|a, b| {
            let ra = a.2.rate[StatKind::WrBytes.index()] + a.2.rate[StatKind::RdBytes.index()];
            let rb = b.2.rate[StatKind::WrBytes.index()] + b.2.rate[StatKind::RdBytes.index()];
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });

        rows.truncate(q.limit);
        rows
    }
}

/// Whether a stored axis identity matches a query axis selector. An
/// `ALL_0`/`ALL_1` selector with name `"ALL"` matches every stored key on
/// that axis, regardless of its concrete kind; otherwise both kind and name
/// must match exactly.
fn axis_matches(key: &(EntityKind, Arc<str>), want: &(EntityKind, String)) -> bool {
    if want.0.matches_all(&want.1) {
        return key.0.axis() == want.0.axis();
    }
    key.0 == want.0 && key.1.as_ref() == want.1
}

/// Parses and ingests one `%sample` control frame's args:
/// `<type0>:<name0> <type1>:<name1> <t> <wr_bytes> <rd_bytes> <nr_reqs>`
/// (§3.1, §6).
pub fn ingest_sample_args(state: &mut AggregatorState, args: &str) -> Result<(), CtlError> {
    let mut it = args.split(' ').filter(|s| !s.is_empty());

    let x0 = it.next().ok_or(CtlError::NrArgs)?;
    let x1 = it.next().ok_or(CtlError::NrArgs)?;
    let (k0, n0) = x0.split_once(':').ok_or(CtlError::NrArgs)?;
    let (k1, n1) = x1.split_once(':').ok_or(CtlError::NrArgs)?;
    let kind0: EntityKind = k0.parse().map_err(|_| CtlError::NoX)?;
    let kind1: EntityKind = k1.parse().map_err(|_| CtlError::NoX)?;

    let t: f64 = it.next().ok_or(CtlError::NrArgs)?.parse().map_err(|_| CtlError::NrArgs)?;
    let wr_bytes: f64 = it.next().ok_or(CtlError::NrArgs)?.parse().map_err(|_| CtlError::NrArgs)?;
    let rd_bytes: f64 = it.next().ok_or(CtlError::NrArgs)?.parse().map_err(|_| CtlError::NrArgs)?;
    let nr_reqs: f64 = it.next().ok_or(CtlError::NrArgs)?.parse().map_err(|_| CtlError::NrArgs)?;

    state.ingest_sample(
        (kind0, Arc::from(n0)),
        (kind1, Arc::from(n1)),
        t,
        [wr_bytes, rd_bytes, nr_reqs],
    );

    Ok(())
}

/// One parsed `/top` response row (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct TopRow {
    pub x0: (EntityKind, String),
    pub x1: (EntityKind, String),
    pub t: f64,
    pub pending: [f64; NR_STATS],
    pub rate: [f64; NR_STATS],
    pub sum: [f64; NR_STATS],
}

/// Parses one `/top` response line: `<type0>:<name0> <type1>:<name1> <t>
/// <pending…> <rate…> <sum…>`.
pub fn parse_top_line(line: &str) -> Option<TopRow> {
    let mut it = line.split(' ').filter(|s| !s.is_empty());

    let x0 = it.next()?;
    let x1 = it.next()?;
    let (k0, n0) = x0.split_once(':')?;
    let (k1, n1) = x1.split_once(':')?;
    let kind0: EntityKind = k0.parse().ok()?;
    let kind1: EntityKind = k1.parse().ok()?;

    let t: f64 = it.next()?.parse().ok()?;

    let mut pending = [0.0; NR_STATS];
    let mut rate = [0.0; NR_STATS];
    let mut sum = [0.0; NR_STATS];
    for slot in pending.iter_mut().chain(rate.iter_mut()).chain(sum.iter_mut()) {
        *slot = it.next()?.parse().ok()?;
    }

    Some(TopRow {
        x0: (kind0, n0.to_string()),
        x1: (kind1, n1.to_string()),
        t,
        pending,
        rate,
        sum,
    })
}

/// Formats one `/top` response row, the inverse of [`parse_top_line`].
pub fn format_top_line(x0: &AxisKey, x1: &AxisKey, sample: &Sample) -> String {
    let mut fields = vec![
        format!("{}:{}", x0.0, x0.1),
        format!("{}:{}", x1.0, x1.1),
        sample.t.to_string(),
    ];
    for v in sample
        .pending
        .iter()
        .chain(sample.rate.iter())
        .chain(sample.sum.iter())
    {
        fields.push(v.to_string());
    }
    fields.join(" ")
}

/// Percent-encodes `s` per §6: unreserved bytes (`A-Za-z0-9.-~_`) pass
/// through; everything else becomes `%HH` upper-case hex. Grounded on
/// `query_escape` in `original_source/xltop.c`.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'~' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Builds a `/top` query string: `x0=<type>:<name>&d0=<d>&x1=<type>:<name>
/// &d1=<d>&limit=<limit>`, percent-encoded per §6. Grounded on
/// `make_top_query`/`query_add` in `original_source/xltop.c`.
pub fn make_query(
    x0: (EntityKind, &str),
    x1: (EntityKind, &str),
    d: (i32, i32),
    limit: usize,
) -> String {
    [
        format!("x0={}", percent_encode(&format!("{}:{}", x0.0, x0.1))),
        format!("d0={}", d.0),
        format!("x1={}", percent_encode(&format!("{}:{}", x1.0, x1.1))),
        format!("d1={}", d.1),
        format!("limit={limit}"),
    ]
    .join("&")
}
