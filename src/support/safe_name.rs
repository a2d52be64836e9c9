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

/// Determine whether the given name is "safe" for use as a pool or namespace
/// name.
///
/// This excludes empty names, names with surrounding whitespace, and names
/// containing control characters or the separators used by the relocation
/// log. The object store itself accepts nearly anything, but names which
/// fail this check are almost certainly the result of a configuration error.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() &&
        name.trim() == name &&
        // Reserved for namespace-qualified locators in diagnostics
        name.find('/').is_none() &&
        // Relocation log field separators
        name.find(|c| c == ';' || c == ':' || c == '=').is_none() &&
        // Don't allow any ASCII control characters
        name.find(|c| c < ' ' || c == '\x7F').is_none()
}

/// Determine whether the given principal name may be mapped to a namespace.
///
/// Principals are used verbatim as object ids within the configuration
/// namespace, so the only restrictions are the absence of control characters
/// and a reasonable length. The empty principal is permitted and never
/// mapped.
pub fn is_safe_principal(principal: &str) -> bool {
    principal.len() <= 1024
        && principal.find(|c| c < ' ' || c == '\x7F').is_none()
}
