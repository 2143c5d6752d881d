//! The aggregator's HTTP surface (§6): the `GET` endpoints viewers and
//! downstream aggregators poll, plus the `sample` control handler wired
//! into a connection's control table.
//!
//! The original source's HTTP surface is a hand-rolled `evhttp` callback
//! table; this is grounded instead on §6's endpoint table, realized with
//! `axum` the way `adamtc007-ob-poc` builds its own HTTP surface — a
//! `State`-extracted shared handle, one handler function per route,
//! plain-text bodies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::conn::{CtlEntry, CtlRequest};
use crate::entity::EntityKind;
use crate::error::CtlError;
use crate::query::{self, AggregatorState, TopQuery};
use crate::refresh::AggregatorRegistries;

/// Everything an aggregator's HTTP handlers read from: the registries the
/// refreshers populate, plus the top-K query engine the control
/// connections' `sample` frames feed. `Clone` is shallow (every field is an
/// `Arc`), as axum requires of its `State` extractor.
#[derive(Clone)]
pub struct AggregatorShared {
    pub regs: AggregatorRegistries,
    pub query_state: Arc<Mutex<AggregatorState>>,
}

impl AggregatorShared {
    pub fn new(regs: AggregatorRegistries) -> Self {
        AggregatorShared {
            regs,
            query_state: Arc::new(Mutex::new(AggregatorState::new())),
        }
    }
}

/// Builds the router serving every endpoint in §6's table.
pub fn build_router(shared: AggregatorShared) -> Router {
    Router::new()
        .route("/:kind/_info", get(kind_info))
        .route("/clus", get(list_clusters))
        .route("/clus/:name", get(cluster_members))
        .route("/clus/:name/_info", get(cluster_info))
        .route("/fs", get(list_filesystems))
        .route("/fs/:name/_status", get(fs_status))
        .route("/top", get(top))
        .with_state(shared)
}

/// Binds `addr` and serves `shared`'s router until the process exits.
pub async fn serve(shared: AggregatorShared, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "aggregator HTTP surface listening");
    axum::serve(listener, build_router(shared)).await
}

fn registry_len(regs: &AggregatorRegistries, kind: &str) -> Option<usize> {
    Some(match kind {
        "host" => regs.hosts.lock().unwrap().len(),
        "job" => regs.jobs.lock().unwrap().len(),
        "clus" => regs.clusters.lock().unwrap().len(),
        "fs" => regs.filesystems.lock().unwrap().len(),
        _ => return None,
    })
}

async fn kind_info(
    State(shared): State<AggregatorShared>,
    Path(kind): Path<String>,
) -> impl IntoResponse {
    match registry_len(&shared.regs, &kind) {
        Some(n) => (StatusCode::OK, format!("x_nr: {n}\n")),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn list_clusters(State(shared): State<AggregatorShared>) -> impl IntoResponse {
    let clusters = shared.regs.clusters.lock().unwrap();
    let body: String = clusters.names().map(|n| format!("{n}\n")).collect();
    (StatusCode::OK, body)
}

async fn cluster_members(
    State(shared): State<AggregatorShared>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let clusters = shared.regs.clusters.lock().unwrap();
    let Some(c) = clusters.get(&name) else {
        return (StatusCode::NOT_FOUND, String::new());
    };

    let jobs = shared.regs.jobs.lock().unwrap();
    let hosts = shared.regs.hosts.lock().unwrap();

    let mut body = String::new();
    for job_name in &c.members {
        let Some(job) = jobs.get(job_name) else { continue };
        for (host_name, host) in hosts.iter() {
            if host.job.as_deref() == Some(job_name.as_str()) {
                body.push_str(&format!(
                    "{} {} {} {} {} {}\n",
                    host_name, job.name, job.owner, job.title, job.start_time, job.nr_hosts
                ));
            }
        }
    }

    (StatusCode::OK, body)
}

async fn cluster_info(
    State(shared): State<AggregatorShared>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let clusters = shared.regs.clusters.lock().unwrap();
    match clusters.get(&name) {
        Some(c) => (StatusCode::OK, format!("interval: {}\noffset: {}\n", c.interval, c.offset)),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn list_filesystems(State(shared): State<AggregatorShared>) -> impl IntoResponse {
    let filesystems = shared.regs.filesystems.lock().unwrap();
    let body: String = filesystems.names().map(|n| format!("{n}\n")).collect();
    (StatusCode::OK, body)
}

/// Re-serves the filesystem's own rolling maxima in the `_status` grammar,
/// as a single line naming the filesystem itself rather than one line per
/// server: the registry (§4.4) only retains the folded maxima a refresh
/// tick computed, not the per-server rows that produced them.
async fn fs_status(
    State(shared): State<AggregatorShared>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let filesystems = shared.regs.filesystems.lock().unwrap();
    match filesystems.get(&name) {
        Some(fs) => {
            let body = format!(
                "{} {} {} {} {} {} {} {}\n",
                fs.name,
                fs.nr_mdt,
                fs.nr_ost,
                fs.oss_load[0],
                fs.oss_load[1],
                fs.oss_load[2],
                fs.max_oss_task,
                fs.nr_nid,
            );
            (StatusCode::OK, body)
        }
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Parses one `x0`/`x1` query parameter (`<type>:<name>`) into an axis
/// selector.
fn parse_axis_param(raw: &str) -> Result<(EntityKind, String), ()> {
    let (kind, name) = raw.split_once(':').ok_or(())?;
    let kind: EntityKind = kind.parse().map_err(|_| ())?;
    Ok((kind, name.to_string()))
}

fn parse_top_query(params: &HashMap<String, String>) -> Option<TopQuery> {
    let x0 = parse_axis_param(params.get("x0")?).ok()?;
    let x1 = parse_axis_param(params.get("x1")?).ok()?;
    let d0: i32 = params.get("d0")?.parse().ok()?;
    let d1: i32 = params.get("d1")?.parse().ok()?;
    let limit: usize = params.get("limit")?.parse().ok()?;

    Some(TopQuery { x0, d0, x1, d1, limit })
}

async fn top(
    State(shared): State<AggregatorShared>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(q) = parse_top_query(&params) else {
        return (StatusCode::BAD_REQUEST, String::new());
    };

    let state = shared.query_state.lock().unwrap();
    let rows = state.query(&q);

    let mut body = String::new();
    for (x0, x1, sample) in &rows {
        body.push_str(&query::format_top_line(x0, x1, sample));
        body.push('\n');
    }

    (StatusCode::OK, body)
}

/// The control-table handler for `%sample` frames (§6, §4.5): ingests the
/// agent's push into the shared top-K query engine.
pub fn h_sample(state: &mut Arc<Mutex<AggregatorState>>, req: &CtlRequest) -> Result<(), CtlError> {
    query::ingest_sample_args(&mut state.lock().unwrap(), req.args)
}

/// The control table a `Connection<IO, Arc<Mutex<AggregatorState>>>` is
/// constructed with for the aggregator's control-protocol port.
pub const CTL_TABLE: &[CtlEntry<Arc<Mutex<AggregatorState>>>] =
    &[CtlEntry { name: "sample", handler: h_sample }];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Cluster, Host, Job};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn populated_shared() -> AggregatorShared {
        let regs = AggregatorRegistries::new();
        regs.clusters.lock().unwrap().lookup_or_insert_with("c", || Cluster {
            name: "c".to_string(),
            members: vec!["j1@c".to_string()],
            interval: 30.0,
            offset: 5.0,
        });
        regs.jobs.lock().unwrap().lookup_or_insert_with("j1@c", || Job {
            name: "j1@c".to_string(),
            owner: "alice".to_string(),
            title: "sim".to_string(),
            start_time: 100.0,
            nr_hosts: 1,
            cluster: "c".to_string(),
        });
        regs.hosts
            .lock()
            .unwrap()
            .lookup_or_insert_with("h1", || Host::new("h1"))
            .job = Some("j1@c".to_string());

        AggregatorShared::new(regs)
    }

    #[tokio::test]
    async fn cluster_info_endpoint_reports_interval_and_offset() {
        let router = build_router(populated_shared());
        let response = router
            .oneshot(Request::builder().uri("/clus/c/_info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("interval: 30"));
        assert!(text.contains("offset: 5"));
    }

    #[tokio::test]
    async fn cluster_members_endpoint_joins_host_and_job_records() {
        let router = build_router(populated_shared());
        let response = router
            .oneshot(Request::builder().uri("/clus/c").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text.trim(), "h1 j1@c alice sim 100 1");
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let router = build_router(populated_shared());
        let response = router
            .oneshot(Request::builder().uri("/clus/nope/_info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn top_endpoint_serves_ingested_samples() {
        let shared = populated_shared();
        {
            let mut state = shared.query_state.lock().unwrap();
            query::ingest_sample_args(&mut state, "JOB:j1@c FS:tank 100.5 1048576 0 4").unwrap();
        }
        let router = build_router(shared);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/top?x0=JOB%3Aj1%40c&d0=0&x1=FS%3Atank&d1=0&limit=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("JOB:j1@c FS:tank 100.5"), "body was: {text}");
    }

    #[test]
    fn sample_control_handler_ingests_into_shared_state() {
        let state = Arc::new(Mutex::new(AggregatorState::new()));
        let mut handler_state = state.clone();
        let req = CtlRequest {
            name: "sample",
            tid: 1,
            args: "JOB:j1@c FS:tank 1.0 100 0 0",
        };

        h_sample(&mut handler_state, &req).unwrap();
        assert_eq!(state.lock().unwrap().len(), 1);
    }
}
