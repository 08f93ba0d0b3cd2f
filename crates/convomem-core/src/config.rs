//! Engine-wide configuration: one struct, one `Default` impl carrying
//! the documented defaults, passed in at construction rather than read
//! from ambient global state.

use std::time::Duration;

/// Per-tier concurrency caps applied during `retrieve`'s fan-out.
#[derive(Debug, Clone, Copy)]
pub struct TierReadCaps {
    /// T3: most-recent messages read per retrieval.
    pub t3: usize,
    /// T2: top facts read per retrieval.
    pub t2: usize,
    /// T1: top archive hits read per retrieval.
    pub t1: usize,
    /// TP: patterns considered (the match path always returns at most one).
    pub tp: usize,
}

impl Default for TierReadCaps {
    fn default() -> Self {
        Self { t3: 10, t2: 20, t1: 5, tp: 1 }
    }
}

/// Top-level engine configuration: tier capacities, eviction policy, and
/// background task timing. Construct with `EngineConfig::default()` and
/// override only what a deployment needs to change.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// T3 partition capacity (messages retained per conversation).
    pub short_term_capacity: usize,
    /// T3 partition TTL before it is eligible for background reclamation.
    pub short_term_ttl: chrono::Duration,
    /// T2 eviction predicate: facts accessed fewer than this many times...
    pub fact_min_access: u32,
    /// ...and untouched for longer than this are prunable.
    pub fact_ttl: chrono::Duration,
    /// Deadline for the detached background consolidation task.
    pub background_deadline: Duration,
    /// Per-tier read caps used during `retrieve`.
    pub read_caps: TierReadCaps,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            short_term_capacity: 10,
            short_term_ttl: chrono::Duration::hours(24),
            fact_min_access: 2,
            fact_ttl: chrono::Duration::days(30),
            background_deadline: Duration::from_secs(300),
            read_caps: TierReadCaps::default(),
        }
    }
}

/// Default on-disk location for the SQLite T1 archive, following
/// platform convention (XDG on Linux, Library/Application Support on
/// macOS, %APPDATA% on Windows) rather than hardcoding a path.
#[cfg(feature = "sqlite-archive")]
pub fn default_archive_path() -> Option<std::path::PathBuf> {
    let project_dirs = directories::ProjectDirs::from("dev", "convomem", "core")?;
    Some(project_dirs.data_dir().join("archive.sqlite3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.short_term_capacity, 10);
        assert_eq!(config.short_term_ttl, chrono::Duration::hours(24));
        assert_eq!(config.background_deadline, Duration::from_secs(300));
        assert_eq!(config.read_caps.t3, 10);
        assert_eq!(config.read_caps.t2, 20);
        assert_eq!(config.read_caps.t1, 5);
        assert_eq!(config.read_caps.tp, 1);
    }
}
