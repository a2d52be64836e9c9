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

//! Helpers for treating particular channel failures as success.

use crate::store::ChannelError;

pub trait IgnoreKinds {
    fn ignore_not_found(self) -> Self;
}

impl<R: Default> IgnoreKinds for Result<R, ChannelError> {
    fn ignore_not_found(self) -> Self {
        match self {
            Ok(r) => Ok(r),
            Err(ChannelError::NotFound) => Ok(R::default()),
            Err(e) => Err(e),
        }
    }
}

pub trait NotFoundAsNone {
    type Item;

    /// Convert `Err(NotFound)` into `Ok(None)`.
    fn not_found_as_none(self) -> Result<Option<Self::Item>, ChannelError>;
}

impl<R> NotFoundAsNone for Result<R, ChannelError> {
    type Item = R;

    fn not_found_as_none(self) -> Result<Option<R>, ChannelError> {
        match self {
            Ok(r) => Ok(Some(r)),
            Err(ChannelError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
