// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Lineage identifier of an agent in the spawn tree.
///
/// Internally a path of child indices; `0 → 0.1 → 0.11` is root, first
/// child, first grandchild.  The rendered form looks like a float but is a
/// display convenience only; comparisons use the structured path, so `1.1`
/// and a hypothetical `1.10` are the same lineage while `1.11` means "first
/// child of 1.1", never "eleventh child of 1".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation {
    path: Vec<u32>,
}

impl Generation {
    /// The root agent of a session.
    pub fn root() -> Self {
        Self { path: vec![0] }
    }

    /// The `n`-th child of this lineage (1-based).
    pub fn child(&self, n: u32) -> Self {
        let mut path = self.path.clone();
        path.push(n);
        Self { path }
    }

    /// Parent lineage, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.path.len() <= 1 {
            return None;
        }
        Some(Self { path: self.path[..self.path.len() - 1].to_vec() })
    }

    pub fn depth(&self) -> usize {
        self.path.len() - 1
    }

    /// Whether `self` descends from `ancestor` (strictly).
    pub fn is_descendant_of(&self, ancestor: &Generation) -> bool {
        self.path.len() > ancestor.path.len() && self.path.starts_with(&ancestor.path)
    }
}

impl std::fmt::Display for Generation {
    /// Render as the conventional float-looking lineage: `0`, `0.1`, `0.11`.
    ///
    /// Child indices ≥ 10 render as multiple digits, which is ambiguous to a
    /// reader but never to the engine; ordering and identity always use the
    /// structured path.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path[0])?;
        if self.path.len() > 1 {
            write!(f, ".")?;
            for idx in &self.path[1..] {
                write!(f, "{idx}")?;
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
