//! Monitoring status row contents

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeStatus {
    Running { n: u64, t: u64 },
    /// Retained history is still shorter than the sync window.
    MissingHistory { n: u64, t: u64, minutes: u64 },
    Late { n: u64, t: u64, confirmations: u64 },
}

impl RealtimeStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RealtimeStatus::Running { .. } => "running",
            RealtimeStatus::MissingHistory { .. } | RealtimeStatus::Late { .. } => "running-sync",
        }
    }

    pub fn comment(&self) -> String {
        match self {
            RealtimeStatus::Running { n, t } => format!("N={n} T={t}"),
            RealtimeStatus::MissingHistory { n, t, minutes } => {
                format!("N={n} T={t} (missing {}:{:02})", minutes / 60, minutes % 60)
            }
            RealtimeStatus::Late { n, t, confirmations } => {
                format!("N={n} T={t} (N is late: < T-{confirmations})")
            }
        }
    }
}

/// Classifies the realtime state from `N`, `T` and the retained-history bound.
pub fn realtime_status(
    n: u64,
    t: u64,
    confirmations: u64,
    next_block_time: u64,
    bottom_block_time: Option<u64>,
    window_secs: u64,
) -> RealtimeStatus {
    let covered = bottom_block_time.map_or(0, |bottom| next_block_time.saturating_sub(bottom));
    if bottom_block_time.is_none() || covered <= window_secs {
        let minutes = (window_secs - covered).div_ceil(60);
        return RealtimeStatus::MissingHistory { n, t, minutes };
    }
    if n + confirmations + 2 < t {
        return RealtimeStatus::Late { n, t, confirmations };
    }
    RealtimeStatus::Running { n, t }
}
