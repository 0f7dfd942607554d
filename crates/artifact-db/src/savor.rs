//! Savors: qualifier traits (target frameworks, platforms...) attached to
//! artifact instances and their dependency edges.
//!
//! A [`SavorContext`] declares the closed set of atomic values allowed for one
//! artifact type and the separator used to display combinations. A [`Savors`]
//! value is a non-empty subset of those atoms.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::PackageDbError;

/// Declares the atomic savor values available for an artifact type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SavorContext {
    name: String,
    separator: char,
    values: BTreeSet<String>,
}

impl SavorContext {
    pub fn new<I, S>(name: impl Into<String>, separator: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            separator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    pub fn contains(&self, atom: &str) -> bool {
        self.values.contains(atom)
    }

    /// Parse a separator-joined combination of atoms.
    ///
    /// Every atom must belong to the context and at least one is required.
    pub fn parse(self: &Arc<Self>, text: &str) -> Result<Savors, PackageDbError> {
        let mut atoms = BTreeSet::new();
        for part in text.split(self.separator) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if !self.values.contains(part) {
                return Err(PackageDbError::InvalidSavors {
                    value: text.to_string(),
                    reason: format!("'{}' is not a value of context '{}'", part, self.name),
                });
            }
            atoms.insert(part.to_string());
        }
        if atoms.is_empty() {
            return Err(PackageDbError::InvalidSavors {
                value: text.to_string(),
                reason: "at least one savor is required".to_string(),
            });
        }
        Ok(Savors {
            context: Arc::clone(self),
            atoms,
        })
    }

    /// The savor made of every value of the context.
    pub fn all(self: &Arc<Self>) -> Option<Savors> {
        if self.values.is_empty() {
            return None;
        }
        Some(Savors {
            context: Arc::clone(self),
            atoms: self.values.clone(),
        })
    }
}

/// A non-empty combination of atoms from one [`SavorContext`].
#[derive(Clone)]
pub struct Savors {
    context: Arc<SavorContext>,
    atoms: BTreeSet<String>,
}

impl Savors {
    pub fn context(&self) -> &Arc<SavorContext> {
        &self.context
    }

    pub fn atoms(&self) -> impl Iterator<Item = &str> {
        self.atoms.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    fn same_context(&self, other: &Savors) -> bool {
        self.context.name == other.context.name
    }

    pub fn is_subset_of(&self, other: &Savors) -> bool {
        self.same_context(other) && self.atoms.is_subset(&other.atoms)
    }

    /// Union of both combinations. `None` when the contexts differ.
    pub fn union(&self, other: &Savors) -> Option<Savors> {
        if !self.same_context(other) {
            return None;
        }
        Some(Savors {
            context: Arc::clone(&self.context),
            atoms: self.atoms.union(&other.atoms).cloned().collect(),
        })
    }

    /// Common atoms. `None` when the contexts differ or nothing is shared.
    pub fn intersect(&self, other: &Savors) -> Option<Savors> {
        if !self.same_context(other) {
            return None;
        }
        let atoms: BTreeSet<String> = self.atoms.intersection(&other.atoms).cloned().collect();
        if atoms.is_empty() {
            return None;
        }
        Some(Savors {
            context: Arc::clone(&self.context),
            atoms,
        })
    }
}

impl PartialEq for Savors {
    fn eq(&self, other: &Self) -> bool {
        self.same_context(other) && self.atoms == other.atoms
    }
}

impl Eq for Savors {}

impl fmt::Display for Savors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for atom in &self.atoms {
            if !first {
                write!(f, "{}", self.context.separator)?;
            }
            first = false;
            f.write_str(atom)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Savors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Savors({}: {})", self.context.name, self)
    }
}
