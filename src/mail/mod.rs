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

//! The mail object and the layout of its metadata on stored objects.

pub mod codec;
pub mod model;

pub use self::codec::{MetadataCodec, MetadataStorage};
pub use self::model::{generate_oid, AttrKey, MailObject, MutabilityPolicy};
