use std::{
    collections::hash_map::DefaultHasher,
    fs,
    hash::Hasher,
    path::{Path, PathBuf},
    time::SystemTime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    UpToDate,
    Modified,
    NotFound,
}

/// Timer-driven poll of a watched file's mtime and content hash. A
/// transition from `Modified` to `UpToDate` marks a stable new version.
pub struct FileMonitor {
    path: PathBuf,
    mtime: Option<SystemTime>,
    hash: u64,
    bytes: Vec<u8>,
    status: MonitorStatus,
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

impl FileMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut monitor = Self {
            path: path.into(),
            mtime: None,
            hash: 0,
            bytes: Vec::new(),
            status: MonitorStatus::NotFound,
        };
        // Initial probe records the baseline without reporting Modified.
        if let Ok(bytes) = fs::read(&monitor.path) {
            monitor.hash = content_hash(&bytes);
            monitor.mtime = fs::metadata(&monitor.path)
                .and_then(|meta| meta.modified())
                .ok();
            monitor.bytes = bytes;
            monitor.status = MonitorStatus::UpToDate;
        }
        monitor
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified_time(&self) -> Option<SystemTime> {
        self.mtime
    }

    /// Contents as of the last probe that observed a change.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn last_status(&self) -> MonitorStatus {
        self.status
    }

    pub fn update(&mut self) -> MonitorStatus {
        let Ok(bytes) = fs::read(&self.path) else {
            self.status = MonitorStatus::NotFound;
            return self.status;
        };
        let hash = content_hash(&bytes);
        self.mtime = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
        if hash != self.hash {
            self.hash = hash;
            self.bytes = bytes;
            self.status = MonitorStatus::Modified;
        } else {
            self.status = MonitorStatus::UpToDate;
        }
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("helio-monitor-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn stable_file_reports_up_to_date() {
        let path = temp_path("stable");
        fs::write(&path, b"contents").unwrap();
        let mut monitor = FileMonitor::new(&path);
        assert_eq!(monitor.last_status(), MonitorStatus::UpToDate);
        assert_eq!(monitor.update(), MonitorStatus::UpToDate);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn edit_produces_modified_then_up_to_date_edge() {
        let path = temp_path("edited");
        fs::write(&path, b"v1").unwrap();
        let mut monitor = FileMonitor::new(&path);

        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"v2").unwrap();
        drop(file);

        let last = monitor.last_status();
        let current = monitor.update();
        assert_eq!((last, current), (MonitorStatus::UpToDate, MonitorStatus::Modified));
        assert_eq!(monitor.bytes(), b"v2");

        // Settled: the reload edge.
        let last = monitor.last_status();
        let current = monitor.update();
        assert_eq!((last, current), (MonitorStatus::Modified, MonitorStatus::UpToDate));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_reports_not_found_and_recovers() {
        let path = temp_path("missing");
        fs::remove_file(&path).ok();
        let mut monitor = FileMonitor::new(&path);
        assert_eq!(monitor.last_status(), MonitorStatus::NotFound);
        assert_eq!(monitor.update(), MonitorStatus::NotFound);

        fs::write(&path, b"arrived").unwrap();
        assert_eq!(monitor.update(), MonitorStatus::Modified);
        assert_eq!(monitor.update(), MonitorStatus::UpToDate);
        fs::remove_file(&path).ok();
    }
}
