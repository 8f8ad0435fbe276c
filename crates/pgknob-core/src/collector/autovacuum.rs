//! Autovacuum status and configuration.

use super::collector::{CollectError, Collector};
use super::source::StatsSource;
use crate::model::{AutovacuumSettings, Scope};

impl<S: StatsSource> Collector<S> {
    /// Whether autovacuum can run: both `autovacuum` and `track_counts` are on.
    pub fn autovacuum_enabled(&self) -> Result<bool, CollectError> {
        let flags = self.source().autovacuum_flags()?;
        let is_on = |name: &str| {
            flags
                .iter()
                .any(|(n, setting)| n == name && setting.eq_ignore_ascii_case("on"))
        };
        Ok(is_on("autovacuum") && is_on("track_counts"))
    }

    /// Current instance-wide autovacuum settings.
    pub fn autovacuum_settings(&self) -> Result<(AutovacuumSettings, Scope), CollectError> {
        let pairs = self.source().autovacuum_settings()?;
        let settings =
            AutovacuumSettings::from_pairs(pairs.iter().map(|(n, s)| (n.as_str(), s.as_str())));
        Ok((settings, Scope::General))
    }
}
