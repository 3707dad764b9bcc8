use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::core::conn::{Token, WorkerId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to register fd {fd} with dispatcher: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} is not registered")]
    UnknownToken(Token),

    #[error("connection {token:?} failed with errno {errno}")]
    Connection { token: Token, errno: i32 },

    #[error("cross-worker channel of worker {0} failed")]
    ChannelFailure(WorkerId),

    #[error("datastore is unreachable")]
    DatastoreUnavailable,

    #[error("worker handles were already published")]
    WorkersPublished,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
