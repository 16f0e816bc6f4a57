use std::time::Duration;

/// Engine tunables. Every knob can be set from the environment using the
/// historical parameter names, so deployments keep their existing config.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of buffers in the log page buffer pool. Minimum 3.
    pub log_nbuffers: usize,
    /// Group commit wake interval. Zero disables batching entirely: every
    /// commit flushes on its own.
    pub group_commit_interval: Duration,
    /// Pre-stage sealed active pages in the background for faster archive
    /// rotation.
    pub log_bg_archive: bool,
    /// Take a checkpoint after this many log pages have been appended.
    pub chkpt_every_npages: u32,
    /// Upper bound for TEMP_TEMP volume growth, in pages. -1 is unlimited.
    pub bosr_maxtmp_pages: i32,
    /// Log page size in bytes. Power of two in [512, 16384].
    pub log_page_size: usize,
    /// Data page size in bytes.
    pub io_page_size: usize,
    /// Number of payload pages in the circular active log.
    pub log_npages: i32,
    /// Capacity of the transaction table.
    pub max_clients: usize,
    /// Record bodies at least this large are compressed on append.
    pub compress_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_nbuffers: 128,
            group_commit_interval: Duration::from_millis(0),
            log_bg_archive: false,
            chkpt_every_npages: 1000,
            bosr_maxtmp_pages: -1,
            log_page_size: 4096,
            io_page_size: 4096,
            log_npages: 512,
            max_clients: 100,
            compress_threshold: 255,
        }
    }
}

impl Config {
    /// Overlay environment variables on top of `self`. Unparsable values
    /// are ignored, keeping the current value.
    pub fn overlay_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("log_nbuffers") {
            self.log_nbuffers = n.max(3);
        }
        if let Some(ms) = env_parse::<u64>("log_group_commit_interval_msecs") {
            self.group_commit_interval = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse::<u8>("log_bg_archive") {
            self.log_bg_archive = v != 0;
        }
        if let Some(n) = env_parse::<u32>("chkpt_every_npages") {
            self.chkpt_every_npages = n;
        }
        if let Some(n) = env_parse::<i32>("bosr_maxtmp_pages") {
            self.bosr_maxtmp_pages = n;
        }
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        let sz = self.log_page_size;
        if !(512..=16384).contains(&sz) || !sz.is_power_of_two() {
            return Err(crate::Error::BadLogPageSize(sz as i32));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_bounds() {
        let mut cfg = Config::default();
        assert!(cfg.validate().is_ok());
        cfg.log_page_size = 100;
        assert!(cfg.validate().is_err());
        cfg.log_page_size = 5000;
        assert!(cfg.validate().is_err());
        cfg.log_page_size = 16384;
        assert!(cfg.validate().is_ok());
    }
}
