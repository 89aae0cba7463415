//! Path handling for the operation surface.

use crate::error::{Error, Result};

/// A validated absolute path, split into components.
///
/// Empty segments from doubled or trailing slashes are discarded; an empty
/// component list means the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    components: Vec<String>,
}

impl FsPath {
    /// Parse a path string. Paths must be absolute (start with `/`).
    pub fn parse(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return Err(Error::InvalidPath(format!(
                "path must be absolute: {}",
                path
            )));
        }

        let components: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        for component in &components {
            if component == "." || component == ".." {
                return Err(Error::InvalidPath(format!(
                    "invalid path component: {}",
                    component
                )));
            }
        }

        Ok(Self { components })
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Path components, outermost first.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// All components except the last (the parent directory chain).
    pub fn parent_components(&self) -> &[String] {
        match self.components.len() {
            0 => &[],
            n => &self.components[..n - 1],
        }
    }

    /// The final component, or `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }
}

impl std::fmt::Display for FsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            write!(f, "/{}", self.components.join("/"))
        }
    }
}
