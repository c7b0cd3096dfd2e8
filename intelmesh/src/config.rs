// intelmesh/src/config.rs
//
// All coordinator tunables with their defaults. Loadable from a JSON file
// via --config; unset fields keep defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Trust bounds
    pub initial_trust: f64,                 // 0.5 — also the decay attractor
    pub min_trust:     f64,                 // 0.1
    pub max_trust:     f64,                 // 1.0

    // Trust scoring
    pub w_accuracy:           f64,          // 0.40
    pub w_contribution:       f64,          // 0.20
    pub w_responsiveness:     f64,          // 0.20
    pub w_consistency:        f64,          // 0.20
    pub contribution_norm:    f64,          // 50 reports saturate contribution
    pub responsiveness_tau_secs: f64,       // 60
    pub consistency_window:   usize,        // last K outcomes, K = 20
    pub alpha:                f64,          // learning rate 0.25

    // Decay
    pub decay_rate:          f64,           // 0.95 per interval
    pub decay_interval_secs: u64,           // 1 h

    // Consensus
    pub consensus_threshold:   u32,         // 2 distinct reporters
    pub consensus_trust_avg:   f64,         // 0.6 mean reporter trust
    pub critical_trust_bypass: f64,         // 0.8 — single-reporter critical path

    // Lifecycle sweeps
    pub ioc_ttl_secs:              i64,     // 30 days without reports → expired
    pub expire_sweep_interval_secs: u64,    // 6 h
    pub heartbeat_interval_secs:   u64,     // 30 s; offline after 3 missed
    pub reaper_interval_secs:      u64,     // 30 s

    // Fabric
    pub outbound_queue_size: usize,         // 1024 frames per session
    pub handler_timeout_secs: u64,          // 5 s inbound handler deadline
    pub snapshot_limit:      usize,         // initial snapshot cap for new clients
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_trust: 0.5,
            min_trust:     0.1,
            max_trust:     1.0,

            w_accuracy:              0.40,
            w_contribution:          0.20,
            w_responsiveness:        0.20,
            w_consistency:           0.20,
            contribution_norm:       50.0,
            responsiveness_tau_secs: 60.0,
            consistency_window:      20,
            alpha:                   0.25,

            decay_rate:          0.95,
            decay_interval_secs: 3600,

            consensus_threshold:   2,
            consensus_trust_avg:   0.6,
            critical_trust_bypass: 0.8,

            ioc_ttl_secs:               30 * 24 * 3600,
            expire_sweep_interval_secs: 6 * 3600,
            heartbeat_interval_secs:    30,
            reaper_interval_secs:       30,

            outbound_queue_size: 1024,
            handler_timeout_secs: 5,
            snapshot_limit:      1000,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.initial_trust, 0.5);
        assert_eq!(c.consensus_threshold, 2);
        assert_eq!(c.outbound_queue_size, 1024);
        let weights = c.w_accuracy + c.w_contribution + c.w_responsiveness + c.w_consistency;
        assert!((weights - 1.0).abs() < 1e-9);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = serde_json::from_str(r#"{"consensus_threshold": 3}"#).unwrap();
        assert_eq!(c.consensus_threshold, 3);
        assert_eq!(c.decay_rate, 0.95);
    }
}
