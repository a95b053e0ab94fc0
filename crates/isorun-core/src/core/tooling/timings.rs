use std::time::Instant;

pub(crate) const TIMINGS_ENV: &str = "ISORUN_TIMINGS";

pub(crate) fn is_truthy(raw: &str) -> bool {
    let value = raw.trim();
    !value.is_empty()
        && !matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
}

/// Stages of a run that get their own timing line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Setup,
    Manifests,
    Files,
    Run,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Manifests => "manifests",
            Self::Files => "files",
            Self::Run => "run",
        }
    }
}

/// Logs the wall time of a [`Phase`] when it goes out of scope, along with
/// the number of items it handled if one was recorded.
pub(crate) struct TimingGuard {
    phase: Phase,
    start: Instant,
    items: Option<usize>,
}

impl TimingGuard {
    pub(crate) fn start(enabled: bool, phase: Phase) -> Option<Self> {
        enabled.then(|| Self {
            phase,
            start: Instant::now(),
            items: None,
        })
    }

    pub(crate) fn items(&mut self, count: usize) {
        self.items = Some(count);
    }
}

impl Drop for TimingGuard {
    fn drop(&mut self) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        match self.items {
            Some(items) => tracing::info!(phase = self.phase.as_str(), elapsed_ms, items, "timing"),
            None => tracing::info!(phase = self.phase.as_str(), elapsed_ms, "timing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy(" yes "));
        assert!(!is_truthy("Off"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn disabled_timings_create_no_guard() {
        assert!(TimingGuard::start(false, Phase::Run).is_none());
        let mut guard = TimingGuard::start(true, Phase::Files).unwrap();
        guard.items(3);
        assert_eq!(guard.phase, Phase::Files);
        assert_eq!(guard.items, Some(3));
    }
}
