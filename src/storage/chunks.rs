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

use crate::store::WriteOp;

/// Compute the `(offset, length)` of each write needed to store `len` bytes
/// when no single write may exceed `max_write` bytes.
///
/// Empty content still needs one (empty) write so that the payload is
/// truncated.
pub fn plan(len: u64, max_write: u64) -> Vec<(u64, u64)> {
    let max_write = max_write.max(1);
    if 0 == len {
        return vec![(0, 0)];
    }

    let mut chunks = Vec::with_capacity(((len - 1) / max_write + 1) as usize);
    let mut offset = 0;
    while offset < len {
        let chunk = (len - offset).min(max_write);
        chunks.push((offset, chunk));
        offset += chunk;
    }
    chunks
}

/// Append the writes storing `content` to `op`.
///
/// The first chunk replaces the payload entirely, so stale bytes beyond the
/// new length never survive; later chunks are written at their offsets.
pub fn append_content(op: &mut WriteOp, content: &[u8], max_write: u64) {
    for (offset, len) in plan(content.len() as u64, max_write) {
        let data = content[offset as usize..(offset + len) as usize].to_vec();
        if 0 == offset {
            op.write_full(data);
        } else {
            op.write(offset, data);
        }
    }
}
