//! The `<dbname>_lginf` trail: a human-readable, append-only record of log
//! administration events. Each line carries a timestamp prefix and a
//! message id from a fixed catalog.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub const MSG_COMMENT: &str = "COMMENT:";
pub const MSG_ARCHIVE: &str = "ACTIVE:";
pub const MSG_DELETABLE: &str = "REMOVABLE:";
pub const MSG_CHKPT: &str = "CHECKPOINT:";
pub const MSG_MEDIA_RECOVERY: &str = "RECOVERY:";

#[derive(Debug)]
pub struct LogInfo {
    path: PathBuf,
    file: File,
}

impl LogInfo {
    pub fn open(dir: &Path, dbname: &str) -> Result<Self> {
        let path = dir.join(format!("{dbname}_lginf"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, msg_id: &str, msg: &str) {
        let stamp = chrono::Local::now().format("%m/%d/%y %H:%M:%S%.3f");
        // the trail is advisory; a write failure must never fail the caller
        if let Err(e) = writeln!(self.file, "{stamp} - {msg_id} {msg}") {
            tracing::warn!("could not append to log info trail: {e}");
        }
    }

    pub fn archive_created(&mut self, arv_path: &Path, fpageid: i32, lpageid: i32) {
        self.append(
            MSG_ARCHIVE,
            &format!(
                "archive {} created, contains log pages {fpageid} to {lpageid}",
                arv_path.display()
            ),
        );
    }

    pub fn archives_deletable(&mut self, first_arv: i32, last_arv: i32) {
        self.append(
            MSG_DELETABLE,
            &format!("archives {first_arv} to {last_arv} are no longer needed"),
        );
    }

    pub fn checkpoint_finished(&mut self, chkpt_lsa: crate::Lsa) {
        self.append(MSG_CHKPT, &format!("checkpoint ended at {chkpt_lsa}"));
    }

    pub fn log_created(&mut self, dbname: &str) {
        self.append(MSG_COMMENT, &format!("active log for database {dbname} created"));
    }

    pub fn media_recovery_finished(&mut self, stopat: i64, redone: usize, undone: usize) {
        self.append(
            MSG_MEDIA_RECOVERY,
            &format!(
                "media recovery stopped at time {stopat}; \
                 {redone} records redone, {undone} transactions rolled back"
            ),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lines_carry_timestamp_and_msg_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = LogInfo::open(dir.path(), "demo").unwrap();
        info.archive_created(Path::new("demo_lgar000"), 0, 7);
        let text = std::fs::read_to_string(info.path()).unwrap();
        let line = text.lines().next().unwrap();
        assert!(line.contains(" - "));
        assert!(line.contains(MSG_ARCHIVE));
        assert!(line.contains("demo_lgar000"));
        // "MM/DD/YY HH:MM:SS.mmm" prefix
        assert_eq!(line.as_bytes()[2], b'/');
        assert_eq!(line.as_bytes()[5], b'/');
    }
}
