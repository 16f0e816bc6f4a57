pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] marlin_storage::Error),
    #[error("cannot connect to the replica database server")]
    CantConnectServer,
    #[error("log page {0} unavailable after bounded retries")]
    ArchiveUnavailable(i32),
    #[error("bad page {0} in copied log")]
    BadPage(i32),
    #[error("applier memory cap exceeded; restart required")]
    NoSpace,
    #[error("row operation failed: {0}")]
    Apply(String),
}

impl Error {
    /// Lost connections and the self-imposed memory cap shut the applier
    /// down; everything else is counted and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::CantConnectServer | Error::NoSpace | Error::BadPage(_) | Error::ArchiveUnavailable(_)
        )
    }
}
