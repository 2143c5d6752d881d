//! The entity data model (§3): a closed kind enumeration over two
//! independent axes, and the Host/Job/Cluster/Filesystem records the
//! aggregator's registries hold.

use std::fmt;
use std::str::FromStr;

/// One of the two independent axes every sample pairs an entity from.
/// Axis 0 describes workload (host/job/cluster); axis 1 describes storage
/// targets (server/filesystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Zero,
    One,
}

/// The closed entity-kind enumeration, with a fixed per-axis ordering used
/// as "depth" in top-K queries (§4.5). `All0`/`All1` are synthetic rollups
/// that match every entity on their axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Host,
    Job,
    Clus,
    All0,
    Serv,
    Fs,
    All1,
}

impl EntityKind {
    pub const AXIS0: [EntityKind; 4] =
        [EntityKind::Host, EntityKind::Job, EntityKind::Clus, EntityKind::All0];
    pub const AXIS1: [EntityKind; 3] =
        [EntityKind::Serv, EntityKind::Fs, EntityKind::All1];

    pub fn axis(self) -> Axis {
        match self {
            EntityKind::Host | EntityKind::Job | EntityKind::Clus | EntityKind::All0 => {
                Axis::Zero
            }
            EntityKind::Serv | EntityKind::Fs | EntityKind::All1 => Axis::One,
        }
    }

    /// Position within this kind's axis ordering; used to compute `depth`
    /// (the difference between a queried concrete kind and a rollup kind).
    pub fn depth_index(self) -> i32 {
        match self {
            EntityKind::Host => 0,
            EntityKind::Job => 1,
            EntityKind::Clus => 2,
            EntityKind::All0 => 3,
            EntityKind::Serv => 0,
            EntityKind::Fs => 1,
            EntityKind::All1 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Host => "HOST",
            EntityKind::Job => "JOB",
            EntityKind::Clus => "CLUS",
            EntityKind::All0 => "ALL_0",
            EntityKind::Serv => "SERV",
            EntityKind::Fs => "FS",
            EntityKind::All1 => "ALL_1",
        }
    }

    /// Whether `name` on this kind matches every entity on its axis, i.e.
    /// this is one of the `ALL_*` rollups and `name == "ALL"`.
    pub fn matches_all(self, name: &str) -> bool {
        matches!(self, EntityKind::All0 | EntityKind::All1) && name == "ALL"
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEntityKind;

impl fmt::Display for UnknownEntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unrecognized entity type")
    }
}

impl std::error::Error for UnknownEntityKind {}

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "HOST" => EntityKind::Host,
            "JOB" => EntityKind::Job,
            "CLUS" => EntityKind::Clus,
            "ALL_0" => EntityKind::All0,
            "SERV" => EntityKind::Serv,
            "FS" => EntityKind::Fs,
            "ALL_1" => EntityKind::All1,
            _ => return Err(UnknownEntityKind),
        })
    }
}

/// `{ name, job }` — a host's job reference is nullable and, when present,
/// must point to a record still present in the job registry (§3 invariant).
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub job: Option<String>,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Host {
            name: name.into(),
            job: None,
        }
    }
}

/// `{ name, owner, title, start_time, nr_hosts, cluster }`. `name` is
/// globally qualified `JOBID@CLUS`.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub owner: String,
    pub title: String,
    pub start_time: f64,
    pub nr_hosts: u32,
    pub cluster: String,
}

/// A cluster's job membership list and its refresh schedule. The refresh
/// task handle is owned by the refresher that spawned it (§4.4), not by
/// this record, so cancelling a refresh is a matter of dropping that
/// handle rather than mutating this struct.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub members: Vec<String>,
    pub interval: f64,
    pub offset: f64,
}

/// Rolling 1/5/15 load maxima and target/task/NID counts for one
/// filesystem, recomputed wholesale on every refresh tick (§4.4).
#[derive(Debug, Clone, Default)]
pub struct Filesystem {
    pub name: String,
    pub mds_load: [f64; 3],
    pub oss_load: [f64; 3],
    pub nr_mds: u64,
    pub nr_mdt: u64,
    pub max_mds_task: u64,
    pub nr_oss: u64,
    pub nr_ost: u64,
    pub max_oss_task: u64,
    pub nr_nid: u64,
}

impl Filesystem {
    pub fn new(name: impl Into<String>) -> Self {
        Filesystem {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Resets the per-refresh accumulators without discarding the name.
    pub fn reset_accumulators(&mut self) {
        let name = std::mem::take(&mut self.name);
        *self = Filesystem::default();
        self.name = name;
    }

    /// Folds one server's status sample into this filesystem's maxima, per
    /// the reconciliation rule in §4.4: a server is MDS-classified if it
    /// reports any MDTs, else OSS-classified if it reports any OSTs.
    pub fn ingest(&mut self, status: &ServerStatusSample) {
        if status.nr_mdt > 0 {
            for i in 0..3 {
                self.mds_load[i] = self.mds_load[i].max(status.load[i]);
            }
            self.nr_mds += 1;
            self.max_mds_task = self.max_mds_task.max(status.nr_task);
        } else if status.nr_ost > 0 {
            for i in 0..3 {
                self.oss_load[i] = self.oss_load[i].max(status.load[i]);
            }
            self.nr_oss += 1;
            self.max_oss_task = self.max_oss_task.max(status.nr_task);
        }

        self.nr_mdt += status.nr_mdt;
        self.nr_ost += status.nr_ost;
        self.nr_nid = self.nr_nid.max(status.nr_nid);
    }
}

/// Wire-only server status sample: `<server> <nr_mdt> <nr_ost> <load1>
/// <load5> <load15> <nr_task> <nr_nid>`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServerStatusSample {
    pub nr_mdt: u64,
    pub nr_ost: u64,
    pub load: [f64; 3],
    pub nr_task: u64,
    pub nr_nid: u64,
}

impl ServerStatusSample {
    /// Parses `<nr_mdt> <nr_ost> <load1> <load5> <load15> <nr_task>
    /// <nr_nid>` (the server name is split off by the caller).
    pub fn parse(fields: &[&str]) -> Option<Self> {
        if fields.len() != 7 {
            return None;
        }
        Some(ServerStatusSample {
            nr_mdt: fields[0].parse().ok()?,
            nr_ost: fields[1].parse().ok()?,
            load: [
                fields[2].parse().ok()?,
                fields[3].parse().ok()?,
                fields[4].parse().ok()?,
            ],
            nr_task: fields[5].parse().ok()?,
            nr_nid: fields[6].parse().ok()?,
        })
    }
}
