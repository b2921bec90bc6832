use std::io;

use thiserror::Error;

use crate::{reading::ReadingError, wire::FrameError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("bad reading: {0}")]
    Reading(#[from] ReadingError),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}
