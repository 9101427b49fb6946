use chrono::Utc;

use fedsync_core::ModelVersion;

/// Mints model versions from the wall clock.
///
/// A version is the current unix time in milliseconds, or the previous version plus one if the
/// clock hasn't advanced past it. Minted versions strictly increase until they saturate at
/// `u64::MAX`.
#[derive(Debug, Clone, Default)]
pub struct VersionClock {
    last: Option<u64>,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues after a stored version. Versions that aren't minted by a clock are ignored.
    pub fn resume(version: &ModelVersion) -> Self {
        Self {
            last: version.as_str().parse().ok(),
        }
    }

    /// Mints the next version.
    pub fn next_version(&mut self) -> ModelVersion {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.next_at(now)
    }

    fn next_at(&mut self, now: u64) -> ModelVersion {
        let version = match self.last {
            Some(last) if now <= last => last.saturating_add(1),
            _ => now,
        };
        self.last = Some(version);
        ModelVersion::from(version)
    }
}
