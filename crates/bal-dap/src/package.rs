use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::error::BalAdapterError;

static PACKAGE_DECLARATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"package\s+([a-zA-Z_][.\w]*);").expect("package declaration pattern is valid")
});

/// Returns the dotted module path declared by `source`, if any.
pub fn declared_package(source: &str) -> Option<String> {
    PACKAGE_DECLARATION
        .captures(source)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn read_declared_package(path: &Path) -> Result<Option<String>, BalAdapterError> {
    let source = fs::read_to_string(path).map_err(|e| {
        BalAdapterError::FileError(format!("Failed to read '{}': {}", path.display(), e))
    })?;
    Ok(declared_package(&source))
}

/// Splits a dotted module path into its segments.
pub fn segments(package: &str) -> impl Iterator<Item = &str> {
    package.split('.').filter(|segment| !segment.is_empty())
}
