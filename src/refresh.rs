//! Periodic entity refreshers (§4.4): polling tasks that keep the cluster
//! job-membership and filesystem-health registries in sync with the
//! aggregator's HTTP surface.
//!
//! Grounded on `xl_clus_cb`/`xl_clus_add`/`xl_fs_cb`/`xl_fs_add` in
//! `original_source/xltop.c`, restructured from `ev_periodic` callbacks into
//! `tokio::time::interval_at`-driven tasks. Each refresher's body-parsing
//! logic is split out as a plain function so it can be exercised without a
//! live HTTP round trip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::entity::{Cluster, Filesystem, Host, Job, ServerStatusSample};
use crate::registry::{self, Registry};

/// Thin `reqwest` wrapper scoping every refresher's requests to one
/// aggregator base URL.
#[derive(Clone)]
pub struct RefreshClient {
    http: reqwest::Client,
    base_url: String,
}

impl RefreshClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        RefreshClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_text(&self, path: &str) -> reqwest::Result<String> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        self.http.get(url).send().await?.error_for_status()?.text().await
    }
}

fn parse_kv_f64(body: &str, key: &str) -> Option<f64> {
    body.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim().parse().ok()).flatten()
    })
}

/// Shared registry handles a cluster refresher folds observed membership
/// into. `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>`: this state is also
/// reachable from the aggregator's axum handlers, and axum's `serve` spawns
/// a task per connection via `tokio::spawn`, which requires `Send`
/// regardless of the runtime's thread count. The program still runs
/// `#[tokio::main(flavor = "current_thread")]` per §5 — a single OS thread
/// never contends these locks — this is a `Send`-compliance concession,
/// not a departure from the single-threaded scheduling model.
#[derive(Clone)]
pub struct AggregatorRegistries {
    pub hosts: Arc<Mutex<Registry<Host>>>,
    pub jobs: Arc<Mutex<Registry<Job>>>,
    pub clusters: Arc<Mutex<Registry<Cluster>>>,
    pub filesystems: Arc<Mutex<Registry<Filesystem>>>,
}

impl AggregatorRegistries {
    pub fn new() -> Self {
        AggregatorRegistries {
            hosts: Arc::new(Mutex::new(Registry::new())),
            jobs: Arc::new(Mutex::new(Registry::new())),
            clusters: Arc::new(Mutex::new(Registry::new())),
            filesystems: Arc::new(Mutex::new(Registry::new())),
        }
    }
}

impl Default for AggregatorRegistries {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one `/clus/<name>` response body (`<host> <job> <owner> <title>
/// <start> <nr_hosts>` per line), registers/updates hosts and jobs, and
/// reconciles the cluster's membership list: any job that was a member
/// before this tick but was not observed in `body` is deleted from the job
/// registry, freeing its owner/title strings along with it (§4.4).
pub fn reconcile_cluster_tick(body: &str, clus_name: &str, regs: &AggregatorRegistries) {
    let mut seen: Vec<String> = Vec::new();

    for line in body.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        let [host, job, owner, title, start, nr_hosts] = fields.as_slice() else {
            continue;
        };
        let Ok(start_time) = start.parse::<f64>() else {
            continue;
        };
        let Ok(nr_hosts) = nr_hosts.parse::<u32>() else {
            continue;
        };

        regs.jobs.lock().unwrap().lookup_or_insert_with(job, || Job {
            name: (*job).to_string(),
            owner: (*owner).to_string(),
            title: (*title).to_string(),
            start_time,
            nr_hosts,
            cluster: clus_name.to_string(),
        });

        regs.hosts.lock().unwrap().lookup_or_insert_with(host, || Host::new(*host)).job =
            Some((*job).to_string());

        seen.push((*job).to_string());
    }

    let mut clusters = regs.clusters.lock().unwrap();
    let Some(c) = clusters.get_mut(clus_name) else {
        return;
    };

    let stale: Vec<String> = c
        .members
        .iter()
        .filter(|m| !seen.contains(m))
        .cloned()
        .collect();

    for job_name in &stale {
        regs.jobs.lock().unwrap().remove(job_name);
    }

    c.members = seen;
}

/// Parses one `/fs/<name>/_status` response body (`<server>
/// <serv_status_fields…>` per line), resetting the filesystem's rolling
/// accumulators and re-folding every server's status sample into them
/// (§4.4, `Filesystem::ingest`).
pub fn reconcile_fs_tick(body: &str, fs_name: &str, filesystems: &Registry<Filesystem>) -> Filesystem {
    let mut fs = filesystems
        .get(fs_name)
        .cloned()
        .unwrap_or_else(|| Filesystem::new(fs_name));
    fs.reset_accumulators();

    for line in body.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.is_empty() {
            continue;
        }
        let Some(sample) = ServerStatusSample::parse(&fields[1..]) else {
            continue;
        };
        fs.ingest(&sample);
    }

    fs
}

/// Fetches `clus/<name>/_info`, extracts `interval:`/`offset:`, and returns
/// the periodic tick schedule (`xl_clus_add`'s `c_off = fmod(offset + 1,
/// interval)` phase nudge, kept verbatim) alongside the same body's
/// `x_nr:`/`x_nr_hint:` size hint (§4.2) — the expected number of jobs this
/// cluster will contribute to the shared job registry.
pub async fn bootstrap_cluster(
    client: &RefreshClient,
    name: &str,
) -> reqwest::Result<Option<(Duration, Duration, usize)>> {
    let body = client.get_text(&format!("clus/{name}/_info")).await?;
    let interval = parse_kv_f64(&body, "interval");
    let offset = parse_kv_f64(&body, "offset");
    let size_hint = registry::parse_size_hint(&body);

    Ok(match (interval, offset) {
        (Some(interval), Some(offset)) if interval > 0.0 => {
            let phase = (offset + 1.0).rem_euclid(interval);
            Some((Duration::from_secs_f64(interval), Duration::from_secs_f64(phase), size_hint))
        },
        _ => None,
    })
}

/// Drives one cluster's refresh loop until `cancel` fires.
pub async fn run_cluster_refresher(
    client: RefreshClient,
    clus_name: Arc<str>,
    regs: AggregatorRegistries,
    interval: Duration,
    phase: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + phase, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = cancel.cancelled() => return,
        }

        match client.get_text(&format!("clus/{clus_name}")).await {
            Ok(body) => reconcile_cluster_tick(&body, &clus_name, &regs),
            Err(error) => warn!(%error, clus = %clus_name, "cluster refresh request failed"),
        }
    }
}

/// Drives one filesystem's status-refresh loop until `cancel` fires.
pub async fn run_fs_refresher(
    client: RefreshClient,
    fs_name: Arc<str>,
    filesystems: Arc<Mutex<Registry<Filesystem>>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = cancel.cancelled() => return,
        }

        match client.get_text(&format!("fs/{fs_name}/_status")).await {
            Ok(body) => {
                let fs = reconcile_fs_tick(&body, &fs_name, &filesystems.lock().unwrap());
                let mut reg = filesystems.lock().unwrap();
                *reg.lookup_or_insert_with(&fs_name, || Filesystem::new(fs_name.as_ref())) = fs;
            },
            Err(error) => warn!(%error, fs = %fs_name, "filesystem status refresh request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_reconciliation_drops_stale_jobs_and_keeps_fresh_ones() {
        let regs = AggregatorRegistries::new();
        regs.clusters.lock().unwrap().lookup_or_insert_with("c", || Cluster {
            name: "c".to_string(),
            members: Vec::new(),
            interval: 30.0,
            offset: 0.0,
        });

        let r1 = "h1 j1@c owner1 title1 100 1\nh2 j2@c owner2 title2 100 1\n";
        reconcile_cluster_tick(r1, "c", &regs);

        assert!(regs.jobs.lock().unwrap().contains("j1@c"));
        assert!(regs.jobs.lock().unwrap().contains("j2@c"));

        let r2 = "h2 j2@c owner2 title2 100 1\nh3 j3@c owner3 title3 100 1\n";
        reconcile_cluster_tick(r2, "c", &regs);

        let jobs = regs.jobs.lock().unwrap();
        assert!(!jobs.contains("j1@c"), "j1 should have been reconciled away");
        assert!(jobs.contains("j2@c"));
        assert!(jobs.contains("j3@c"));
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn cluster_reconciliation_skips_malformed_lines() {
        let regs = AggregatorRegistries::new();
        regs.clusters.lock().unwrap().lookup_or_insert_with("c", || Cluster {
            name: "c".to_string(),
            members: Vec::new(),
            interval: 30.0,
            offset: 0.0,
        });

        reconcile_cluster_tick("not enough fields\n", "c", &regs);
        assert!(regs.jobs.lock().unwrap().is_empty());
    }

    #[test]
    fn fs_reconciliation_resets_then_refolds_accumulators() {
        let mut filesystems: Registry<Filesystem> = Registry::new();
        filesystems.lookup_or_insert_with("tank", || Filesystem::new("tank"));

        let body = "oss1 0 4 1.0 2.0 3.0 7 12\nmds1 2 0 0.5 0.5 0.5 1 12\n";
        let fs = reconcile_fs_tick(body, "tank", &filesystems);

        assert_eq!(fs.nr_oss, 1);
        assert_eq!(fs.nr_mds, 1);
        assert_eq!(fs.oss_load, [1.0, 2.0, 3.0]);
        assert_eq!(fs.nr_nid, 12);
    }
}
