//! Optional YAML config-file overlay (§1.1, §6's `-c/--conf` collaborator
//! surface): every binary's CLI flags take precedence, falling back to the
//! config file, falling back to a hard default.
//!
//! Grounded on the `serde`/`serde_yaml` dependency used elsewhere in this
//! codebase for wire-level YAML stats bodies, repurposed here for config
//! loading — the same crates, a different document shape.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// One upstream source the aggregator refreshes from: a cluster's job-list
/// service or a filesystem's status service, named and addressed
/// independently of the aggregator's own listen address (§6's aggregator
/// CLI flags have no room for a list of upstream sources, so these are
/// config-file-only; there is no CLI equivalent to overlay against).
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshTarget {
    pub name: String,
    pub base_url: String,
}

/// Every key any of the three binaries might read from a config file. Each
/// binary only consults the subset relevant to it.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigFile {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub ctl_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub interval: Option<f64>,
    pub job: Option<String>,
    pub limit: Option<usize>,
    pub debug: Option<bool>,
    pub clusters: Option<Vec<RefreshTarget>>,
    pub filesystems: Option<Vec<RefreshTarget>>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolves one effective value: an explicit CLI flag wins, then the config
/// file's value, then `default`.
pub fn overlay<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_cli_then_file_then_default() {
        assert_eq!(overlay(Some(1234), Some(9999), 80), 1234);
        assert_eq!(overlay(None, Some(9999), 80), 9999);
        assert_eq!(overlay::<u16>(None, None, 80), 80);
    }

    #[test]
    fn config_overlay_yields_documented_effective_port() {
        let path = std::env::temp_dir().join(format!("xltop-config-test-{}.yaml", std::process::id()));
        std::fs::write(&path, "port: 9999\n").unwrap();

        let cfg = ConfigFile::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // No CLI flag: config file's port wins.
        assert_eq!(overlay(None, cfg.port, 8080u16), 9999);

        // Explicit CLI flag overrides the config file.
        assert_eq!(overlay(Some(1111u16), cfg.port, 8080), 1111);
    }

    #[test]
    fn refresh_targets_parse_from_yaml_lists() {
        let yaml = "clusters:\n  - name: c\n    base_url: http://c.example/\nfilesystems:\n  - name: tank\n    base_url: http://tank.example/\n";
        let cfg: ConfigFile = serde_yaml::from_str(yaml).unwrap();

        let clusters = cfg.clusters.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "c");

        let filesystems = cfg.filesystems.unwrap();
        assert_eq!(filesystems[0].base_url, "http://tank.example/");
    }
}
