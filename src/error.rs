use crate::sid::Sid;

/// The error taxonomy of the engine. Tool and parse failures bubble up from
/// the osutils layer; everything else originates here.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("device with sid {0} not found")]
    DeviceNotFound(Sid),

    #[error("{0} not found")]
    NotFound(String),

    #[error("holder with sid {0} not found")]
    HolderNotFound(Sid),

    #[error("devicegraph '{0}' not found")]
    GraphNotFound(String),

    #[error("devicegraph '{0}' already exists")]
    GraphExists(String),

    #[error("invalid devicegraph name '{0}'")]
    InvalidGraphName(String),

    #[error("pool '{0}' not found")]
    PoolNotFound(String),

    #[error("pool '{0}' already exists")]
    PoolExists(String),

    #[error("device sid {sid} has wrong type: expected {expected}, found {found}")]
    WrongType {
        sid: Sid,
        expected: &'static str,
        found: &'static str,
    },

    #[error("wrong number of children: expected {expected}, found {found}")]
    WrongNumberOfChildren { expected: usize, found: usize },

    #[error("holder already exists between sid {holder_source} and sid {target}")]
    HolderAlreadyExists { holder_source: Sid, target: Sid },

    #[error("null reference: {0}")]
    NullReference(&'static str),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("pool out of space")]
    PoolOutOfSpace,

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("failed to take the advisory lock: {0}")]
    Lock(String),

    #[error(transparent)]
    Cmd(#[from] osutils::errors::CmdError),

    #[error(transparent)]
    Parse(#[from] osutils::errors::ParseError),

    #[error(transparent)]
    File(#[from] osutils::errors::FileError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
