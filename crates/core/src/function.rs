//! Function locator: a located function with its name, bounds and callers.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use tracing::debug;

use crate::context::BinaryContext;
use crate::engine::RunContext;
use crate::error::{EngineError, EngineResult};
use crate::matcher::Match;

/// A function found from a pattern match, with its non-recursive callers.
#[derive(Debug, Clone)]
pub struct FunctionLocator {
    /// Address the locator was created from.
    pub origin: u64,
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Identifier of the pattern hit that located this function.
    pub identifier: Option<String>,
    /// Addresses referencing `start` from other functions, deduplicated.
    pub callers: Vec<u64>,
}

impl FunctionLocator {
    /// Resolve the function containing `address`.
    ///
    /// With `create_if_missing` the host is asked to create a function first
    /// and the lookup is retried once.
    pub fn new(
        ctx: &mut dyn BinaryContext,
        address: u64,
        identifier: Option<&str>,
        create_if_missing: bool,
    ) -> EngineResult<Self> {
        let range = match ctx.function_at(address) {
            Some(range) => range,
            None if create_if_missing => {
                if !ctx.create_function(address) {
                    return Err(EngineError::NoFunction(address));
                }
                let range = ctx.function_at(address).ok_or(EngineError::NoFunction(address))?;
                debug!("Created function at 0x{:X}", range.start);
                range
            }
            None => return Err(EngineError::NoFunction(address)),
        };

        let name = ctx.name_of(range.start).unwrap_or_else(|| format!("sub_{:X}", range.start));
        let mut seen = HashSet::new();
        let callers = ctx
            .xrefs_to(range.start)
            .into_iter()
            .filter(|&from| ctx.function_at(from).map(|caller| caller.start) != Some(range.start))
            .filter(|from| seen.insert(*from))
            .collect();

        Ok(Self {
            origin: address,
            start: range.start,
            end: range.end,
            name,
            identifier: identifier.map(str::to_string),
            callers,
        })
    }

    pub fn caller_count(&self) -> usize {
        self.callers.len()
    }

    /// Rename the function and return the name the host applied.
    ///
    /// An empty name resets the host default. When the host resolves a name
    /// collision the applied name differs from `new_name`; that name is kept
    /// and returned.
    pub fn rename(&mut self, ctx: &mut dyn BinaryContext, new_name: &str) -> Option<String> {
        let applied = ctx.rename(self.start, new_name);
        match &applied {
            None if new_name.is_empty() => {
                debug!("Failed to reset name at 0x{:X}", self.start)
            }
            None => debug!("Failed to rename at 0x{:X}", self.start),
            Some(name) => {
                if !new_name.is_empty() && name != new_name {
                    debug!("Host changed name \"{new_name}\" to \"{name}\"");
                }
                self.name = name.clone();
            }
        }
        applied
    }
}

impl fmt::Display for FunctionLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}() : {:#08x} - {:#08x}", self.name, self.start, self.end)
    }
}

impl PartialEq for FunctionLocator {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for FunctionLocator {}

impl Hash for FunctionLocator {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

/// Build one locator per distinct function hit by `matches`.
///
/// Matches outside any function are skipped with a note. When `rename_to`
/// is set every located function is renamed to it.
pub fn locate_functions(
    ctx: &mut dyn BinaryContext,
    matches: &[Match],
    rename_to: Option<&str>,
    run: &mut RunContext,
) -> Vec<FunctionLocator> {
    let mut seen = HashSet::new();
    let mut located = Vec::new();
    for m in matches {
        let mut func = match FunctionLocator::new(ctx, m.address, m.identifier.as_deref(), true) {
            Ok(func) => func,
            Err(err) => {
                run.note(format!("Unable to locate function for match at 0x{:X}: {err}", m.address));
                continue;
            }
        };
        if let Some(name) = rename_to {
            match func.rename(ctx, name) {
                Some(applied) if applied != name && !name.is_empty() => {
                    run.note(format!("Host changed name \"{name}\" to \"{applied}\""))
                }
                Some(_) => {}
                None => run.note(format!("Failed to rename function at 0x{:X}", func.start)),
            }
        }
        if seen.insert(func.clone()) {
            located.push(func);
        }
    }
    located
}
