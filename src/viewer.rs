//! The Viewer Driver (§4.6): periodic `GET top?<query>` polling, response
//! parsing, and a pluggable render callback standing in for the
//! out-of-scope terminal UI.
//!
//! Grounded on `top_timer_cb`/`top_msg_cb` in `original_source/xltop.c` —
//! a periodic timer that clears and refills a fixed-capacity sample array,
//! re-expressed with a capacity-reserved `Vec` (§4.6's Rust realization
//! note) and a `reqwest::Client` in place of the original's `curl_x`
//! one-shot multi handle, matching `refresh.rs`'s `RefreshClient`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::entity::EntityKind;
use crate::query::{self, TopRow};

/// One `(x0, d0, x1, d1, limit)` selector the driver repeatedly queries,
/// plus the opaque `sort_key`/`sum` display hints (§9 open question:
/// "Sort key and sum/rate mode selection ... are accepted but not wired;
/// specify server-side sorting and let the viewer pass it through
/// verbatim"). The engine is free to ignore either.
#[derive(Debug, Clone)]
pub struct ViewerQuery {
    pub x0: (EntityKind, String),
    pub d0: i32,
    pub x1: (EntityKind, String),
    pub d1: i32,
    pub limit: usize,
    pub sort_key: Option<String>,
    pub sum: bool,
}

/// One positional `<type>[:<name>]` selector argument, parsed but not yet
/// folded into axis precedence.
struct Selector {
    kind: EntityKind,
    name: Option<String>,
}

/// Parses one positional selector the way `xl_sep` splits `arg` on `:` in
/// `original_source/xltop.c`. The type token is matched case-insensitively
/// and accepts the bare axis-rollup spellings `all0`/`all1` alongside the
/// wire form `ALL_0`/`ALL_1`.
fn parse_selector(arg: &str) -> Result<Selector, String> {
    let (type_str, name) = match arg.split_once(':') {
        Some((t, n)) => (t, Some(n.to_string())),
        None => (arg, None),
    };
    let normalized = match type_str.to_uppercase().as_str() {
        "ALL0" => "ALL_0".to_string(),
        "ALL1" => "ALL_1".to_string(),
        other => other.to_string(),
    };
    let kind = normalized.parse::<EntityKind>().map_err(|_| format!("unrecognized selector type `{type_str}` in `{arg}`"))?;
    Ok(Selector { kind, name })
}

/// Folds a viewer's positional selectors into one axis's `(coarsest-named,
/// finest-named-with-value, depth)` triple, mirroring the two descending
/// `for (i = X_ALL_0; i >= X_HOST; i--)`-style loops in
/// `original_source/xltop.c`: `order` walks from the coarsest kind to the
/// finest, and since a later (finer) match overwrites an earlier (coarser)
/// one, the most specific selector named on this axis always wins.
fn fold_axis(
    order: &[EntityKind],
    selectors: &[Selector],
    default_t: EntityKind,
) -> ((EntityKind, String), i32) {
    let mut c = default_t;
    let mut t = default_t;
    let mut x = "ALL".to_string();

    for &kind in order.iter().rev() {
        if let Some(sel) = selectors.iter().find(|s| s.kind == kind) {
            c = kind;
            if let Some(name) = &sel.name {
                t = kind;
                x = name.clone();
            }
        }
    }

    let d = t.depth_index() - c.depth_index();
    ((t, x), d)
}

/// Translates a viewer's positional `<type>[:<name>]` arguments into a
/// [`ViewerQuery`], the Rust counterpart of `xltop.c`'s `xl_sep` call per
/// argument followed by its two per-axis folding loops and the job
/// `JOBID@CLUS` auto-qualification check. Defaults both axes to their
/// coarsest rollup (`ALL_0`/`ALL_1`, depth `0`) when no selector names
/// either axis at all.
pub fn build_viewer_query(args: &[String], limit: usize) -> Result<ViewerQuery, String> {
    let selectors = args.iter().map(|a| parse_selector(a)).collect::<Result<Vec<_>, _>>()?;

    let (mut x0, d0) = fold_axis(&EntityKind::AXIS0, &selectors, EntityKind::All0);
    let (x1, d1) = fold_axis(&EntityKind::AXIS1, &selectors, EntityKind::All1);

    if x0.0 == EntityKind::Job && !x0.1.contains('@') {
        let clus = selectors
            .iter()
            .find(|s| s.kind == EntityKind::Clus)
            .and_then(|s| s.name.clone())
            .ok_or_else(|| "must specify job as JOBID@CLUS, or pass a clus:NAME selector".to_string())?;
        x0.1 = format!("{}@{}", x0.1, clus);
    }

    Ok(ViewerQuery { x0, d0, x1, d1, limit, sort_key: None, sum: false })
}

impl ViewerQuery {
    fn to_query_string(&self) -> String {
        let mut s = query::make_query(
            (self.x0.0, &self.x0.1),
            (self.x1.0, &self.x1.1),
            (self.d0, self.d1),
            self.limit,
        );
        if let Some(sort_key) = &self.sort_key {
            s.push_str("&sort_key=");
            s.push_str(&query::percent_encode(sort_key));
        }
        if self.sum {
            s.push_str("&sum=1");
        }
        s
    }
}

/// Drives the periodic `GET top?<query>` poll against one aggregator.
pub struct ViewerDriver {
    http: reqwest::Client,
    base_url: String,
    query: ViewerQuery,
    top_k: Vec<TopRow>,
    renderer: Box<dyn Fn(&[TopRow]) + Send>,
}

impl ViewerDriver {
    pub fn new(
        base_url: impl Into<String>,
        query: ViewerQuery,
        renderer: impl Fn(&[TopRow]) + Send + 'static,
    ) -> Self {
        let limit = query.limit;
        ViewerDriver {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            query,
            top_k: Vec::with_capacity(limit),
            renderer: Box::new(renderer),
        }
    }

    pub fn top_k(&self) -> &[TopRow] {
        &self.top_k
    }

    /// One tick: clears `top_k`, fetches, parses, and notifies the
    /// renderer. A failed fetch or an entirely malformed body leaves
    /// `top_k` empty for this tick rather than retrying inline — the next
    /// scheduled tick is the only retry (§4.6).
    pub async fn tick(&mut self) {
        self.top_k.clear();

        let url = format!("{}/top?{}", self.base_url.trim_end_matches('/'), self.query.to_query_string());
        let body = match self.http.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.text().await {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "viewer fetch: failed to read response body");
                        self.notify();
                        return;
                    }
                },
                Err(error) => {
                    warn!(%error, "viewer fetch: aggregator returned an error status");
                    self.notify();
                    return;
                }
            },
            Err(error) => {
                warn!(%error, url = %url, "viewer fetch failed");
                self.notify();
                return;
            }
        };

        for line in body.lines() {
            if line.is_empty() {
                break;
            }
            if let Some(row) = query::parse_top_line(line) {
                self.top_k.push(row);
            }
        }

        self.notify();
    }

    fn notify(&self) {
        (self.renderer)(&self.top_k);
    }
}

/// Runs `driver`'s tick on `interval` until `cancel` fires.
pub async fn run_viewer_loop(mut driver: ViewerDriver, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = cancel.cancelled() => return,
        }

        driver.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sample_query() -> ViewerQuery {
        ViewerQuery {
            x0: (EntityKind::Job, "ALL".to_string()),
            d0: 1,
            x1: (EntityKind::Fs, "tank".to_string()),
            d1: 0,
            limit: 10,
            sort_key: None,
            sum: false,
        }
    }

    #[test]
    fn query_string_matches_make_query_grammar() {
        let q = sample_query();
        let s = q.to_query_string();
        assert!(s.contains("x0=JOB%3AALL"));
        assert!(s.contains("x1=FS%3Atank"));
        assert!(s.contains("limit=10"));
    }

    #[test]
    fn sort_key_and_sum_are_forwarded_as_opaque_query_parameters() {
        let mut q = sample_query();
        q.sort_key = Some("wr bytes".to_string());
        q.sum = true;
        let s = q.to_query_string();
        assert!(s.contains("sort_key=wr%20bytes"));
        assert!(s.contains("sum=1"));
    }

    #[test]
    fn omitted_sort_key_and_unset_sum_add_nothing_to_the_query_string() {
        let s = sample_query().to_query_string();
        assert!(!s.contains("sort_key"));
        assert!(!s.contains("sum"));
    }

    #[tokio::test]
    async fn tick_against_an_unreachable_aggregator_clears_and_renders_empty() {
        let rendered: Arc<Mutex<Option<Vec<TopRow>>>> = Arc::new(Mutex::new(None));
        let rendered_clone = rendered.clone();

        let mut driver = ViewerDriver::new(
            "http://127.0.0.1:1",
            sample_query(),
            move |rows: &[TopRow]| {
                *rendered_clone.lock().unwrap() = Some(rows.to_vec());
            },
        );

        driver.tick().await;

        assert!(driver.top_k().is_empty());
        assert_eq!(rendered.lock().unwrap().as_ref().unwrap().len(), 0);
    }

    #[test]
    fn no_selectors_default_to_all_rollup_on_both_axes() {
        let q = build_viewer_query(&[], 4096).unwrap();
        assert_eq!(q.x0, (EntityKind::All0, "ALL".to_string()));
        assert_eq!(q.d0, 0);
        assert_eq!(q.x1, (EntityKind::All1, "ALL".to_string()));
        assert_eq!(q.d1, 0);
        assert_eq!(q.limit, 4096);
    }

    #[test]
    fn bare_job_selector_sets_the_rollup_but_leaves_the_target_at_default() {
        // A type-only selector (no `:name`) only ever touches `c`, the
        // rollup kind; `t`/`x` stay at their axis default since no
        // selector gave an explicit name.
        let q = build_viewer_query(&["job".to_string()], 10).unwrap();
        assert_eq!(q.x0, (EntityKind::All0, "ALL".to_string()));
        assert_eq!(q.d0, EntityKind::All0.depth_index() - EntityKind::Job.depth_index());
    }

    #[test]
    fn named_job_under_a_cluster_fully_qualifies_from_the_clus_selector() {
        // `job:bar` carries a name, so it overwrites both `c` and `t` to
        // `Job` — the same selector sets its own rollup, giving depth 0.
        let q = build_viewer_query(&["clus:foo".to_string(), "job:bar".to_string()], 10).unwrap();
        assert_eq!(q.x0, (EntityKind::Job, "bar@foo".to_string()));
        assert_eq!(q.d0, 0);
    }

    #[test]
    fn already_qualified_job_name_is_left_alone() {
        let q = build_viewer_query(&["job:bar@foo".to_string()], 10).unwrap();
        assert_eq!(q.x0.1, "bar@foo");
    }

    #[test]
    fn unqualified_job_without_a_clus_selector_is_an_error() {
        assert!(build_viewer_query(&["job:bar".to_string()], 10).is_err());
    }

    #[test]
    fn fs_selector_sets_axis_one_and_leaves_axis_zero_at_default() {
        let q = build_viewer_query(&["fs:tank".to_string()], 10).unwrap();
        assert_eq!(q.x0, (EntityKind::All0, "ALL".to_string()));
        assert_eq!(q.x1, (EntityKind::Fs, "tank".to_string()));
        assert_eq!(q.d1, 0);
    }

    #[test]
    fn unrecognized_selector_type_is_an_error() {
        assert!(build_viewer_query(&["bogus:x".to_string()], 10).is_err());
    }
}
