#[derive(Default)]
pub struct ServeStats {
    #[cfg(feature = "stats")]
    files: std::sync::atomic::AtomicU64,
    #[cfg(feature = "stats")]
    archives: std::sync::atomic::AtomicU64,
    #[cfg(feature = "stats")]
    rejected_logins: std::sync::atomic::AtomicU64,
}

#[cfg_attr(not(feature = "stats"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSnapshot {
    pub files: u64,
    pub archives: u64,
    pub rejected_logins: u64,
}

impl ServeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file(&self) {
        #[cfg(feature = "stats")]
        self.files.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_archive(&self) {
        #[cfg(feature = "stats")]
        self.archives
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn record_rejected_login(&self) {
        #[cfg(feature = "stats")]
        self.rejected_logins
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(feature = "stats")]
    pub fn snapshot(&self) -> ServeSnapshot {
        ServeSnapshot {
            files: self.files.load(std::sync::atomic::Ordering::Relaxed),
            archives: self.archives.load(std::sync::atomic::Ordering::Relaxed),
            rejected_logins: self
                .rejected_logins
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[cfg(all(test, feature = "stats"))]
mod tests {
    use super::*;

    #[test]
    fn counters_are_independent() {
        let stats = ServeStats::new();
        stats.record_file();
        stats.record_file();
        stats.record_archive();

        assert_eq!(
            stats.snapshot(),
            ServeSnapshot {
                files: 2,
                archives: 1,
                rejected_logins: 0,
            }
        );
    }
}
