//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Clustermail.
//
// Clustermail is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Clustermail is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Clustermail. If not, see <http://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

use crate::store::completion::FromCancel;
use crate::store::ChannelError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Object not found")]
    NotFound,
    #[error("Write failed with code {0}")]
    WriteFailed(i32),
    #[error("Read failed with code {0}")]
    ReadFailed(i32),
    #[error("Copy target does not match its source")]
    VerificationFailed,
    #[error("Operation timed out")]
    Timeout,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Object exists but carries no mail metadata")]
    NoMetadata,
    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),
    #[error("Mail lacks required attribute '{0}'")]
    IncompleteMetadata(char),
    #[error("Object of {0} bytes exceeds the maximum object size")]
    ObjectTooLarge(u64),
    #[error("Unsafe pool, namespace, or principal name")]
    UnsafeName,
    #[error("Relocation source and destination are the same object")]
    RelocationInPlace,
    #[error("No alt storage pool configured")]
    NoAltStorage,
    #[error("Relocation log not configured")]
    NoRelocationLog,
    #[error("Malformed relocation log line: {0}")]
    MalformedLogLine(String),
    #[error("Invalid configuration: {0}")]
    BadConfig(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Map a channel failure on a read path into the engine taxonomy.
    pub fn from_read(e: ChannelError) -> Self {
        match e {
            ChannelError::NotFound => Error::NotFound,
            ChannelError::TimedOut => Error::Timeout,
            ChannelError::Cancelled => Error::Cancelled,
            e => Error::ReadFailed(e.code()),
        }
    }

    /// Map a channel failure on a write path into the engine taxonomy.
    pub fn from_write(e: ChannelError) -> Self {
        match e {
            ChannelError::NotFound => Error::NotFound,
            ChannelError::TimedOut => Error::Timeout,
            ChannelError::Cancelled => Error::Cancelled,
            e => Error::WriteFailed(e.code()),
        }
    }

    /// Whether replay or a caller may simply try the operation again.
    pub fn is_recoverable(&self) -> bool {
        match *self {
            Error::WriteFailed(_)
            | Error::ReadFailed(_)
            | Error::VerificationFailed
            | Error::Timeout
            | Error::Cancelled => true,
            _ => false,
        }
    }
}

impl FromCancel for Error {
    fn cancelled() -> Self {
        Error::Cancelled
    }
}
