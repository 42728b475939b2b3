//! Runtime configuration: quantum length, the 19-slot schedule table, table
//! sizes, and the FAT image path. Loaded from an optional TOML file via
//! `serde`; compiled-in defaults match spec §3/§4 exactly when no file is
//! supplied.

use std::path::Path;

use serde::Deserialize;

use crate::error::FsError;

/// spec §4.3: ten 10ms ticks per quantum.
pub const DEFAULT_QUANTUM_MS: u64 = 100;

/// spec §4.3: a fixed 19-slot table giving the long-run ratio 9:6:4
/// (high:zero:low), matching `original_source/src/scheduler.c`'s
/// `create_array` exactly (slots 0,3,6,9 = low; slots 1,4,7,10,12,14 = zero;
/// everything else = high). Priorities use spec §3's `{-1, 0, +1}` encoding
/// (`-1` = high, `+1` = low).
pub const DEFAULT_SCHEDULE_TABLE: [i8; 19] = [
    1, 0, -1, 1, 0, -1, 1, 0, -1, 1, 0, -1, 0, -1, 0, -1, -1, -1, -1,
];

/// spec §3: `open_fds` is a fixed-length mapping, 0..128.
pub const MAX_GLOBAL_FDS: usize = 128;

fn count_ok(table: &[i8; 19]) -> bool {
    let (mut high, mut zero, mut low) = (0, 0, 0);
    for &p in table {
        match p {
            -1 => high += 1,
            0 => zero += 1,
            1 => low += 1,
            _ => return false,
        }
    }
    high == 9 && zero == 6 && low == 4
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub quantum_ms: u64,
    pub schedule_table: [i8; 19],
    pub max_global_fds: usize,
    pub fat_image_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quantum_ms: DEFAULT_QUANTUM_MS,
            schedule_table: DEFAULT_SCHEDULE_TABLE,
            max_global_fds: MAX_GLOBAL_FDS,
            fat_image_path: None,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field the file omits.
    pub fn load(path: &Path) -> Result<Self, FsError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)
            .map_err(|e| FsError::InvalidParameter(format!("bad config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), FsError> {
        if !count_ok(&self.schedule_table) {
            return Err(FsError::InvalidParameter(
                "schedule_table must contain exactly nine -1s, six 0s, four 1s".into(),
            ));
        }
        if self.max_global_fds == 0 || self.max_global_fds > 4096 {
            return Err(FsError::InvalidParameter("max_global_fds out of range".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_table_has_spec_ratio() {
        assert!(count_ok(&DEFAULT_SCHEDULE_TABLE));
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }
}
