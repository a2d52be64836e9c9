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

//! The textual line format of the relocation log.
//!
//! Every line is a sequence of `;`-separated fields:
//!
//! ```text
//! save;<pool>;<namespace>;<oid>
//! copy;<pool>;<namespace>;<oid>[;<source>;<updates>[;<source pool>]]
//! move;<pool>;<namespace>;<oid>;<source>;<updates>[;<source pool>]
//! done;<pool>;<namespace>;<oid>
//! ```
//!
//! The pool, namespace and oid always designate the destination. `<source>`
//! is `namespace:oid:principal`, and `<updates>` is a `:`-separated list of
//! `tag=value` pairs to apply at the destination. Without a source pool, the
//! source is in the destination pool. `done` marks the most recent preceding
//! intent for the same destination as having reached its terminal state.
//!
//! Bytes which are significant to the format, control characters, and
//! non-ASCII bytes are written as `%XX`. Readers ignore fields beyond those
//! listed here.

use std::fmt::{self, Write as _};
use std::str::FromStr;

use crate::mail::model::AttrKey;
use crate::support::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Save,
    Copy,
    Move,
}

impl Operation {
    fn keyword(self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Copy => "copy",
            Operation::Move => "move",
        }
    }
}

/// Where a copied or moved object came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocationSource {
    /// `None` if the same as the destination pool.
    pub pool: Option<String>,
    pub namespace: String,
    pub oid: String,
    pub principal: String,
}

/// A recorded intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub operation: Operation,
    pub pool: String,
    pub namespace: String,
    pub oid: String,
    /// Always present for `Move`.
    pub source: Option<RelocationSource>,
    pub updates: Vec<(AttrKey, Vec<u8>)>,
}

/// Identifies the destination an intent and its marker refer to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    pub pool: String,
    pub namespace: String,
    pub oid: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogLine {
    Intent(LogEntry),
    Done(Destination),
}

impl LogEntry {
    pub fn save(pool: &str, namespace: &str, oid: &str) -> Self {
        LogEntry {
            operation: Operation::Save,
            pool: pool.to_owned(),
            namespace: namespace.to_owned(),
            oid: oid.to_owned(),
            source: None,
            updates: vec![],
        }
    }

    pub fn destination(&self) -> Destination {
        Destination {
            pool: self.pool.clone(),
            namespace: self.namespace.clone(),
            oid: self.oid.clone(),
        }
    }

    /// The pool the source object lives in.
    pub fn source_pool(&self) -> Option<&str> {
        self.source
            .as_ref()
            .map(|s| s.pool.as_ref().unwrap_or(&self.pool).as_str())
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            LogLine::Done(ref dest) => write!(
                f,
                "done;{};{};{}",
                escape(dest.pool.as_bytes()),
                escape(dest.namespace.as_bytes()),
                escape(dest.oid.as_bytes())
            ),
            LogLine::Intent(ref entry) => {
                write!(
                    f,
                    "{};{};{};{}",
                    entry.operation.keyword(),
                    escape(entry.pool.as_bytes()),
                    escape(entry.namespace.as_bytes()),
                    escape(entry.oid.as_bytes())
                )?;

                if let Some(ref source) = entry.source {
                    write!(
                        f,
                        ";{}:{}:{};",
                        escape(source.namespace.as_bytes()),
                        escape(source.oid.as_bytes()),
                        escape(source.principal.as_bytes())
                    )?;

                    for (ix, &(key, ref value)) in
                        entry.updates.iter().enumerate()
                    {
                        if ix > 0 {
                            f.write_char(':')?;
                        }
                        write!(f, "{}={}", key.tag(), escape(value))?;
                    }

                    if let Some(ref pool) = source.pool {
                        write!(f, ";{}", escape(pool.as_bytes()))?;
                    }
                }

                Ok(())
            },
        }
    }
}

impl FromStr for LogLine {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Error> {
        let malformed = |why: &str| {
            Error::MalformedLogLine(format!("{}: {:?}", why, line))
        };

        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() < 4 {
            return Err(malformed("too few fields"));
        }

        let pool = unescape_str(fields[1])?;
        let namespace = unescape_str(fields[2])?;
        let oid = unescape_str(fields[3])?;
        if pool.is_empty() || oid.is_empty() {
            return Err(malformed("empty pool or oid"));
        }

        let operation = match fields[0] {
            "done" => {
                return Ok(LogLine::Done(Destination {
                    pool,
                    namespace,
                    oid,
                }))
            },
            "save" => Operation::Save,
            "copy" => Operation::Copy,
            "move" => Operation::Move,
            _ => return Err(malformed("unknown operation")),
        };

        let mut source = None;
        let mut updates = Vec::new();
        if Operation::Save != operation && fields.len() >= 6 {
            let parts: Vec<&str> = fields[4].split(':').collect();
            if 3 != parts.len() {
                return Err(malformed("bad source record"));
            }

            let source_pool = match fields.get(6) {
                Some(pool) if !pool.is_empty() => Some(unescape_str(pool)?),
                _ => None,
            };

            source = Some(RelocationSource {
                pool: source_pool,
                namespace: unescape_str(parts[0])?,
                oid: unescape_str(parts[1])?,
                principal: unescape_str(parts[2])?,
            });

            if !fields[5].is_empty() {
                for update in fields[5].split(':') {
                    let mut kv = update.splitn(2, '=');
                    let key = kv
                        .next()
                        .and_then(AttrKey::from_name)
                        .ok_or_else(|| malformed("bad attribute tag"))?;
                    let value = kv
                        .next()
                        .ok_or_else(|| malformed("attribute without value"))?;
                    updates.push((key, unescape(value)?));
                }
            }
        }

        if Operation::Move == operation && source.is_none() {
            return Err(malformed("move without source"));
        }

        Ok(LogLine::Intent(LogEntry {
            operation,
            pool,
            namespace,
            oid,
            source,
            updates,
        }))
    }
}

fn needs_escape(b: u8) -> bool {
    match b {
        b'%' | b';' | b':' | b'=' => true,
        b if b < 0x20 || b >= 0x7F => true,
        _ => false,
    }
}

fn escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        if needs_escape(b) {
            let _ = write!(out, "%{:02X}", b);
        } else {
            out.push(b as char);
        }
    }
    out
}

fn unescape(s: &str) -> Result<Vec<u8>, Error> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        if b'%' == bytes[ix] {
            let hex = s
                .get(ix + 1..ix + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    Error::MalformedLogLine(format!("bad escape in {:?}", s))
                })?;
            out.push(hex);
            ix += 3;
        } else {
            out.push(bytes[ix]);
            ix += 1;
        }
    }
    Ok(out)
}

fn unescape_str(s: &str) -> Result<String, Error> {
    String::from_utf8(unescape(s)?).map_err(|_| {
        Error::MalformedLogLine(format!("non-UTF-8 field {:?}", s))
    })
}
