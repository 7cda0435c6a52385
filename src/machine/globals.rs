//! The globals table: name → identity record.
//!
//! Each global is backed by an `Ident` record in an append-only arena, so
//! the reference handed out at definition time stays valid however the
//! name map later resizes. Compiled code embeds these references directly
//! as instruction operands; late binding works because the record is
//! created (with an UNDEF placeholder) before any body that mentions it is
//! compiled, and only the record's value is ever rewritten.

use std::collections::HashMap;

use super::cell::Cell;

/// Stable reference to an identity record.
pub type IdentRef = usize;

/// The identity record of one global binding.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: String,
    pub value: Cell,
    /// The binding's body runs on first read instead of at load time.
    pub lazy: bool,
    /// Set while the interpreter is forcing this binding; re-entry is an
    /// error.
    pub in_progress: bool,
}

#[derive(Default)]
pub struct Globals {
    records: Vec<Ident>,
    by_name: HashMap<String, IdentRef>,
}

impl Globals {
    pub fn new() -> Globals {
        Globals::default()
    }

    /// Create or update a binding. The record for a name is created once;
    /// later definitions rewrite its value and lazy flag in place.
    pub fn define(&mut self, name: &str, value: Cell, lazy: bool) -> IdentRef {
        if let Some(&ident) = self.by_name.get(name) {
            let record = &mut self.records[ident];
            record.value = value;
            record.lazy = lazy;
            ident
        } else {
            let ident = self.records.len();
            self.records.push(Ident {
                name: name.to_string(),
                value,
                lazy,
                in_progress: false,
            });
            self.by_name.insert(name.to_string(), ident);
            ident
        }
    }

    pub fn lookup(&self, name: &str) -> Option<IdentRef> {
        self.by_name.get(name).copied()
    }

    pub fn value_of(&self, name: &str) -> Option<Cell> {
        self.lookup(name).map(|ident| self.records[ident].value)
    }

    pub fn get(&self, ident: IdentRef) -> Option<&Ident> {
        self.records.get(ident)
    }

    pub fn get_mut(&mut self, ident: IdentRef) -> Option<&mut Ident> {
        self.records.get_mut(ident)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Debug for Globals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Globals")
            .field("count", &self.records.len())
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}
