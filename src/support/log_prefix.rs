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

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included in at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    component: String,
    principal: Option<String>,
    namespace: Option<String>,
}

impl LogPrefix {
    pub fn new(component: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                component,
                principal: None,
                namespace: None,
            })),
        }
    }

    pub fn set_principal(&self, principal: String) {
        self.inner.lock().unwrap().principal = Some(sanitise(principal));
    }

    pub fn set_namespace(&self, namespace: String) {
        self.inner.lock().unwrap().namespace = Some(sanitise(namespace));
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.component)?;
        if inner.principal.is_some() || inner.namespace.is_some() {
            write!(f, "[")?;
            let mut first = true;
            if let Some(ref principal) = inner.principal {
                write!(f, "{principal}")?;
                first = false;
            }

            if let Some(ref namespace) = inner.namespace {
                if !mem::take(&mut first) {
                    write!(f, " ")?;
                }
                write!(f, "ns={namespace}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_prefix() {
        let prefix = LogPrefix::new("storage".to_owned());
        assert_eq!("storage", prefix.to_string());

        let shared = prefix.clone();
        shared.set_principal("alice\r\n".to_owned());
        assert_eq!("storage[alice]", prefix.to_string());

        prefix.set_namespace("3f2a_u".to_owned());
        assert_eq!("storage[alice ns=3f2a_u]", shared.to_string());
    }
}
