// intelmesh/src/events.rs
//
// Shared domain types flowing through the coordinator: IOCs, per-reporter
// provenance, trust scores, and the audit/event records derived from them.
// Wire frames live in fabric::protocol; store rows are these types as JSON.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoordError;

// ── IOC taxonomy ──────────────────────────────────────────────────────────────

/// The eight indicator kinds. New kinds extend this tag set; per-type
/// canonicalization and validation live in `canonicalize`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IocType {
    FileHash,
    IpAddress,
    Domain,
    Url,
    Email,
    RegistryKey,
    FilePath,
    ProcessName,
}

impl IocType {
    /// Stable tag mixed into the fingerprint. Never reorder or rename.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::FileHash    => "file_hash",
            Self::IpAddress   => "ip_address",
            Self::Domain      => "domain",
            Self::Url         => "url",
            Self::Email       => "email",
            Self::RegistryKey => "registry_key",
            Self::FilePath    => "file_path",
            Self::ProcessName => "process_name",
        }
    }

    /// Canonicalize a raw indicator value for this type.
    /// Identical indicators must canonicalize identically regardless of the
    /// reporter's formatting; values that cannot be canonicalized are rejected.
    pub fn canonicalize(&self, raw: &str) -> Result<String, CoordError> {
        let v = raw.trim();
        if v.is_empty() {
            return Err(CoordError::BadRequest("empty indicator value".into()));
        }
        match self {
            Self::FileHash => {
                let h = v.to_ascii_lowercase();
                let hex_ok = h.chars().all(|c| c.is_ascii_hexdigit());
                // md5 / sha1 / sha256 digest lengths
                if !hex_ok || !matches!(h.len(), 32 | 40 | 64) {
                    return Err(CoordError::BadRequest(format!(
                        "not a recognizable hash digest: {raw:?}"
                    )));
                }
                Ok(h)
            }
            Self::IpAddress => v
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| CoordError::BadRequest(format!("invalid ip address: {raw:?}"))),
            Self::Domain => {
                let d = v.trim_end_matches('.').to_ascii_lowercase();
                if d.is_empty() || d.contains(char::is_whitespace) || !d.contains('.') {
                    return Err(CoordError::BadRequest(format!("invalid domain: {raw:?}")));
                }
                Ok(d)
            }
            Self::Url => {
                // Lowercase scheme + authority; path/query are case-significant.
                let idx = v.find("://").ok_or_else(|| {
                    CoordError::BadRequest(format!("url missing scheme: {raw:?}"))
                })?;
                let path_start = v[idx + 3..].find('/').map(|i| idx + 3 + i).unwrap_or(v.len());
                let mut out = v[..path_start].to_ascii_lowercase();
                out.push_str(&v[path_start..]);
                Ok(out)
            }
            Self::Email => {
                let e = v.to_ascii_lowercase();
                if !e.contains('@') || e.contains(char::is_whitespace) {
                    return Err(CoordError::BadRequest(format!("invalid email: {raw:?}")));
                }
                Ok(e)
            }
            Self::RegistryKey | Self::FilePath | Self::ProcessName => Ok(v.to_string()),
        }
    }
}

impl std::fmt::Display for IocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Deterministic fingerprint: first 16 bytes of SHA-256("{tag}:{canonical}"),
/// hex-encoded. A pure function of (type, canonical value).
pub fn ioc_id(ioc_type: IocType, canonical_value: &str) -> String {
    let mut h = Sha256::new();
    h.update(ioc_type.tag().as_bytes());
    h.update(b":");
    h.update(canonical_value.as_bytes());
    hex::encode(&h.finalize()[..16])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ThreatLevel { Low, Medium, High, Critical }

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low      => write!(f, "low"),
            Self::Medium   => write!(f, "medium"),
            Self::High     => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// IOC lifecycle. `verified` is terminal except for an explicit expire;
/// `verified → pending` never happens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IocStatus { Pending, Verified, Expired }

impl std::fmt::Display for IocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending  => write!(f, "pending"),
            Self::Verified => write!(f, "verified"),
            Self::Expired  => write!(f, "expired"),
        }
    }
}

// ── IOC rows ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ioc {
    pub id:           String,
    pub ioc_type:     IocType,
    pub value:        String,            // canonical form
    pub threat_level: ThreatLevel,
    pub status:       IocStatus,
    pub first_seen:   DateTime<Utc>,
    pub last_seen:    DateTime<Utc>,
    pub report_count: u32,               // distinct reporters, monotonic
    pub verified_at:  Option<DateTime<Utc>>,
    pub metadata:     HashMap<String, String>,
}

/// One reporter's provenance for one IOC. `(ioc_id, client_id)` is unique;
/// re-submission touches `last_seen` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocReport {
    pub ioc_id:                  String,
    pub client_id:               String,
    pub reported_at:             DateTime<Utc>,
    pub last_seen:               DateTime<Utc>,
    pub reporter_trust_at_report: f64,   // snapshot for audit
}

/// Reporter-supplied submission payload (wire + HTTP body form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocPayload {
    #[serde(rename = "type")]
    pub ioc_type:     IocType,
    pub value:        String,
    #[serde(default = "default_threat_level")]
    pub threat_level: ThreatLevel,
    #[serde(default)]
    pub metadata:     HashMap<String, String>,
}

fn default_threat_level() -> ThreatLevel { ThreatLevel::Medium }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResult {
    pub ioc_id:         String,
    pub created:        bool,            // false = existing row updated
    pub newly_verified: bool,
    pub status:         IocStatus,
}

/// Filter for `query`; unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IocFilter {
    pub status:       Option<IocStatus>,
    #[serde(rename = "type")]
    pub ioc_type:     Option<IocType>,
    pub threat_level: Option<ThreatLevel>,
    /// Unix seconds; matches rows with `last_seen` at or after this instant.
    pub since:        Option<i64>,
}

impl IocFilter {
    pub fn matches(&self, ioc: &Ioc) -> bool {
        if let Some(s) = self.status {
            if ioc.status != s { return false; }
        }
        if let Some(t) = self.ioc_type {
            if ioc.ioc_type != t { return false; }
        }
        if let Some(l) = self.threat_level {
            if ioc.threat_level != l { return false; }
        }
        if let Some(since) = self.since {
            if ioc.last_seen.timestamp() < since { return false; }
        }
        true
    }
}

// ── Trust rows ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustScore {
    pub client_id:         String,
    pub value:             f64,
    pub reports_total:     u64,
    pub reports_accepted:  u64,
    pub reports_rejected:  u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_updated_at:   DateTime<Utc>,
    /// Last K report outcomes, 1 = accepted, 0 = rejected. Feeds consistency.
    #[serde(default)]
    pub outcome_history:   VecDeque<u8>,
}

impl TrustScore {
    pub fn new(client_id: &str, initial: f64, now: DateTime<Utc>) -> Self {
        Self {
            client_id:         client_id.to_string(),
            value:             initial,
            reports_total:     0,
            reports_accepted:  0,
            reports_rejected:  0,
            last_heartbeat_at: None,
            last_updated_at:   now,
            outcome_history:   VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustOutcome { Submitted, Accepted, Rejected }

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustReason { Report, Accepted, Rejected, Decay, Manual }

/// Append-only trust audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustEvent {
    pub client_id: String,
    pub at:        DateTime<Utc>,
    pub delta:     f64,
    pub reason:    TrustReason,
}

/// Outcome signal from the Aggregator, consumed by the Trust Manager through
/// a queue. Keeps the dependency one-directional.
#[derive(Debug, Clone)]
pub struct TrustOutcomeEvent {
    pub client_id: String,
    pub outcome:   TrustOutcome,
}

// ── Client registry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    pub hostname:  String,
    pub version:   String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_pure_function_of_type_and_canonical_value() {
        let a = ioc_id(IocType::FileHash, "deadbeefdeadbeefdeadbeefdeadbeef");
        let b = ioc_id(IocType::FileHash, "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        // Different type, same value: different id
        let c = ioc_id(IocType::ProcessName, "deadbeefdeadbeefdeadbeefdeadbeef");
        assert_ne!(a, c);
    }

    #[test]
    fn hash_canonicalization_lowercases_and_validates() {
        let t = IocType::FileHash;
        let canon = t.canonicalize("DEADBEEFDEADBEEFDEADBEEFDEADBEEF").unwrap();
        assert_eq!(canon, "deadbeefdeadbeefdeadbeefdeadbeef");
        assert!(t.canonicalize("nothex").is_err());
        assert!(t.canonicalize("abcd").is_err()); // wrong length
        // canonical forms converge on the same id
        let id1 = ioc_id(t, &t.canonicalize("DeadBeefDeadBeefDeadBeefDeadBeef").unwrap());
        let id2 = ioc_id(t, &t.canonicalize(" deadbeefdeadbeefdeadbeefdeadbeef ").unwrap());
        assert_eq!(id1, id2);
    }

    #[test]
    fn domain_canonicalization() {
        let t = IocType::Domain;
        assert_eq!(t.canonicalize("EvIl.Example.COM.").unwrap(), "evil.example.com");
        assert!(t.canonicalize("not a domain").is_err());
        assert!(t.canonicalize("nodots").is_err());
    }

    #[test]
    fn url_canonicalization_preserves_path_case() {
        let t = IocType::Url;
        let c = t.canonicalize("HTTP://Bad.Example/Payload.BIN").unwrap();
        assert_eq!(c, "http://bad.example/Payload.BIN");
        assert!(t.canonicalize("bad.example/no-scheme").is_err());
    }

    #[test]
    fn ip_canonicalization_reformats() {
        let t = IocType::IpAddress;
        assert_eq!(t.canonicalize(" 10.0.0.1 ").unwrap(), "10.0.0.1");
        assert!(t.canonicalize("999.1.2.3").is_err());
    }

    #[test]
    fn filter_matches_on_all_axes() {
        let ioc = Ioc {
            id:           ioc_id(IocType::Domain, "evil.example.com"),
            ioc_type:     IocType::Domain,
            value:        "evil.example.com".into(),
            threat_level: ThreatLevel::High,
            status:       IocStatus::Pending,
            first_seen:   Utc::now(),
            last_seen:    Utc::now(),
            report_count: 1,
            verified_at:  None,
            metadata:     HashMap::new(),
        };
        assert!(IocFilter::default().matches(&ioc));
        assert!(IocFilter { status: Some(IocStatus::Pending), ..Default::default() }.matches(&ioc));
        assert!(!IocFilter { status: Some(IocStatus::Verified), ..Default::default() }.matches(&ioc));
        assert!(!IocFilter { ioc_type: Some(IocType::Url), ..Default::default() }.matches(&ioc));
        assert!(!IocFilter { since: Some(Utc::now().timestamp() + 60), ..Default::default() }.matches(&ioc));
    }
}
