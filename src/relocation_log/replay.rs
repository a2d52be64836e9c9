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

//! Recovery of unfinished relocations after a crash.
//!
//! Intents are matched against `done` markers; an intent with a marker for
//! the same destination after it is finished and ignored. The rest are
//! resolved in log order:
//!
//! - An unfinished save or copy never reached anyone who relies on it, so its
//!   destination is deleted if it exists.
//! - An unfinished move is rolled forward, so that exactly one copy of the
//!   mail survives, at the destination. Which step to resume at is inferred
//!   from which objects exist.
//!
//! Every resolved intent gets its own `done` marker, so replaying the same
//! log again does nothing. Afterwards the log is compacted down to whatever
//! could not be resolved.

use log::{error, info, warn};

use super::{LogEntry, Operation, RelocationLog, Unfinished};
use crate::storage::{MailStorage, MoveState, RelocationRequest};
use crate::support::error::Error;
use crate::support::error_kinds::{IgnoreKinds, NotFoundAsNone};

/// What a replay pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Unfinished saves and copies whose destination was discarded.
    pub discarded: usize,
    /// Intents which already had a `done` marker.
    pub completed: usize,
    /// Lines which could not be parsed.
    pub malformed: usize,
    /// Intents which could not be resolved now and remain unfinished.
    pub failed: usize,
    /// Moves where neither source nor destination exist any more.
    pub lost: usize,
    /// Moves which were rolled forward, for repairing index references.
    pub moved: Vec<LogEntry>,
    /// Intents left in the log after compaction, or `None` if compaction
    /// failed.
    pub retained: Option<usize>,
}

enum Outcome {
    Discarded,
    Moved,
    Lost,
}

pub fn replay(
    storage: &MailStorage,
    log: &RelocationLog,
) -> Result<ReplayReport, Error> {
    let log_prefix = storage.log_prefix();
    let mut report = ReplayReport::default();
    let mut lines = Vec::new();

    for (lineno, line) in log.read_lines()?.into_iter().enumerate() {
        match line {
            Ok(line) => lines.push(line),
            Err(e) => {
                warn!(
                    "{} Skipping line {} of {}: {}",
                    log_prefix,
                    lineno + 1,
                    log.path().display(),
                    e
                );
                report.malformed += 1;
            },
        }
    }

    let unfinished = Unfinished::of(lines);
    report.completed = unfinished.completed;

    for entry in &unfinished.intents {
        let result = match entry.operation {
            Operation::Save | Operation::Copy => storage
                .discard(&entry.destination())
                .map(|()| Outcome::Discarded),
            Operation::Move => replay_move(storage, entry),
        };

        match result {
            Ok(Outcome::Discarded) => {
                report.discarded += 1;
                mark_done(storage, log, entry);
            },
            Ok(Outcome::Moved) => {
                report.moved.push(entry.clone());
            },
            Ok(Outcome::Lost) => {
                error!(
                    "{} Neither source nor destination of move to {}/{} \
                     exists",
                    log_prefix, entry.namespace, entry.oid
                );
                report.lost += 1;
                mark_done(storage, log, entry);
            },
            Err(e) => {
                error!(
                    "{} Failed to recover {:?} of {}/{}: {}",
                    log_prefix, entry.operation, entry.namespace, entry.oid, e
                );
                report.failed += 1;
            },
        }
    }

    info!(
        "{} Replayed {}: {} discarded, {} moved, {} already done, \
         {} malformed, {} failed, {} lost",
        log_prefix,
        log.path().display(),
        report.discarded,
        report.moved.len(),
        report.completed,
        report.malformed,
        report.failed,
        report.lost
    );

    report.retained = match log.compact() {
        Ok(retained) => Some(retained),
        Err(e) => {
            warn!(
                "{} Failed to compact {}: {}",
                log_prefix,
                log.path().display(),
                e
            );
            None
        },
    };
    Ok(report)
}

fn replay_move(
    storage: &MailStorage,
    entry: &LogEntry,
) -> Result<Outcome, Error> {
    let request = RelocationRequest::from_entry(entry).ok_or_else(|| {
        Error::MalformedLogLine(format!("move of {} lacks source", entry.oid))
    })?;
    let src_pool = entry.source_pool().unwrap_or(entry.pool.as_str());
    let src = storage.handle_for_pool(src_pool)?;
    let dest = storage.handle_for_pool(&entry.pool)?;

    let src_stat = src
        .in_namespace(&request.src_namespace)
        .stat(&request.src_oid)
        .not_found_as_none()
        .map_err(Error::from_read)?;
    let dest_stat = dest
        .in_namespace(&request.dest_namespace)
        .stat(&request.dest_oid)
        .not_found_as_none()
        .map_err(Error::from_read)?;

    let start = match (src_stat, dest_stat) {
        (None, None) => return Ok(Outcome::Lost),
        // The source is only deleted after the copy is complete
        (None, Some(_)) => MoveState::Copied,
        (Some(src), Some(dest)) if src.size == dest.size => MoveState::Copied,
        (Some(_), Some(_)) => {
            dest.in_namespace(&request.dest_namespace)
                .delete(&request.dest_oid)
                .ignore_not_found()
                .map_err(Error::from_write)?;
            MoveState::LogPending
        },
        (Some(_), None) => MoveState::LogPending,
    };

    storage
        .relocation(&request, src, dest, Operation::Move)
        .resume_at(start)
        .run()?;
    Ok(Outcome::Moved)
}

fn mark_done(storage: &MailStorage, log: &RelocationLog, entry: &LogEntry) {
    if let Err(e) = log.append_done(entry.destination()) {
        warn!(
            "{} Failed to mark {}/{} done: {}",
            storage.log_prefix(),
            entry.namespace,
            entry.oid,
            e
        );
    }
}
