use crate::lsa::Lsa;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot mount volume {path}")]
    MountFail { path: String },
    #[error("cannot mount log file {path}")]
    LogMountFail { path: String },
    #[error("full database name is too long: {0}")]
    FullDatabaseNameTooLong(String),
    #[error("unknown volume purpose")]
    UnknownPurpose,
    #[error("bad number of pages for format: {0}")]
    FormatBadNpages(i32),
    #[error("not enough free pages in database (requested {requested})")]
    NotEnoughPages { requested: i32 },
    #[error("unknown volume {0}")]
    UnknownVolume(i16),
    #[error("inconsistent volume header on volume {0}")]
    InconsistentVolHeader(i16),
    #[error("bad page id {pageid} on volume {volid}")]
    BadPageId { volid: i16, pageid: i32 },
    #[error("log page {0} is corrupted")]
    LogPageCorrupted(i32),
    #[error("log record at {0} is corrupted")]
    LogRecordCorrupted(Lsa),
    #[error("bad log page size {0}; must be a power of two in [512, 16384]")]
    BadLogPageSize(i32),
    #[error("transaction table is full")]
    TranTableFull,
    #[error("no transaction at index {0}")]
    NoSuchTranIndex(usize),
    #[error("transaction interrupted")]
    Interrupted,
    #[error("transaction unilaterally aborted")]
    UnilaterallyAborted,
    #[error("savepoint {0:?} does not exist")]
    UnknownSavepoint(String),
    #[error("decompression failed: {0}")]
    Unzip(String),
    #[error("two-phase commit protocol error: {0}")]
    Twopc(String),
}

impl Error {
    /// Corrupt-state errors are fatal during recovery and reported (but
    /// survivable) at runtime.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::LogPageCorrupted(_)
                | Error::LogRecordCorrupted(_)
                | Error::BadPageId { .. }
                | Error::InconsistentVolHeader(_)
        )
    }
}
