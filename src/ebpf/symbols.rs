//! Kernel symbol lookup

use crate::{Result, TracekitError};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Answers whether the running kernel exports a function symbol
pub trait SymbolResolver {
    fn contains(&self, symbol: &str) -> bool;
}

/// Function symbols read from `/proc/kallsyms`
#[derive(Debug, Default)]
pub struct KernelSymbols {
    names: HashSet<String>,
}

impl KernelSymbols {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(KALLSYMS_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TracekitError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let symbols = Self::parse(&text)?;
        debug!(
            "Read {} function symbols from {}",
            symbols.len(),
            path.display()
        );
        Ok(symbols)
    }

    /// Parse kallsyms text: `<address> <type> <name> [module]` per line.
    /// Only text symbols (`t`/`T`) are kept.
    pub fn parse(text: &str) -> Result<Self> {
        let mut names = HashSet::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(_), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(TracekitError::Configuration(format!(
                    "malformed kallsyms line {}: {:?}",
                    lineno + 1,
                    line
                )));
            };
            if kind.eq_ignore_ascii_case("t") {
                names.insert(name.to_string());
            }
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl SymbolResolver for KernelSymbols {
    fn contains(&self, symbol: &str) -> bool {
        self.names.contains(symbol)
    }
}

impl SymbolResolver for HashSet<String> {
    fn contains(&self, symbol: &str) -> bool {
        HashSet::contains(self, symbol)
    }
}

impl<R: SymbolResolver + ?Sized> SymbolResolver for &R {
    fn contains(&self, symbol: &str) -> bool {
        (**self).contains(symbol)
    }
}
