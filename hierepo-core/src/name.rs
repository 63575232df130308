//! Qualified names and hierarchical paths
//!
//! Names are `prefix:local` strings (the prefix may be omitted). Paths are
//! sequences of elements with 1-based same-name-sibling indexes, e.g.
//! `/content/page[2]/jcr:title`.

use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Well-known item names used by the workspace layer
pub mod names {
    pub const JCR_PRIMARY_TYPE: &str = "jcr:primaryType";
    pub const JCR_MIXIN_TYPES: &str = "jcr:mixinTypes";
    pub const JCR_UUID: &str = "jcr:uuid";
    pub const JCR_MERGE_FAILED: &str = "jcr:mergeFailed";
    pub const JCR_PREDECESSORS: &str = "jcr:predecessors";
    pub const JCR_BASE_VERSION: &str = "jcr:baseVersion";
    pub const JCR_VERSION_HISTORY: &str = "jcr:versionHistory";
    pub const JCR_IS_CHECKED_OUT: &str = "jcr:isCheckedOut";
    pub const JCR_LOCK_OWNER: &str = "jcr:lockOwner";
    pub const JCR_LOCK_IS_DEEP: &str = "jcr:lockIsDeep";
    pub const JCR_ROOT: &str = "jcr:root";

    pub const NT_BASE: &str = "nt:base";
    pub const NT_UNSTRUCTURED: &str = "nt:unstructured";
    pub const NT_HIERARCHY_NODE: &str = "nt:hierarchyNode";
    pub const NT_FOLDER: &str = "nt:folder";
    pub const NT_FILE: &str = "nt:file";
    pub const NT_RESOURCE: &str = "nt:resource";
    pub const REP_ROOT: &str = "rep:root";

    pub const MIX_REFERENCEABLE: &str = "mix:referenceable";
    pub const MIX_VERSIONABLE: &str = "mix:versionable";
    pub const MIX_LOCKABLE: &str = "mix:lockable";
}

const ILLEGAL_NAME_CHARS: &[char] = &['/', '[', ']', '*', '|', '\t', '\r', '\n'];

/// A qualified item name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    /// Parse and validate a name
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let local = match raw.split_once(':') {
            Some((prefix, local)) => {
                if prefix.is_empty() || prefix.contains(char::is_whitespace) {
                    return Err(RepositoryError::IllegalArgument(format!(
                        "invalid namespace prefix in name '{}'",
                        raw
                    )));
                }
                local
            }
            None => raw.as_str(),
        };
        if local.is_empty()
            || local == "."
            || local == ".."
            || local.contains(':')
            || local.contains(ILLEGAL_NAME_CHARS)
            || local.trim() != local
        {
            return Err(RepositoryError::IllegalArgument(format!(
                "invalid name '{}'",
                raw
            )));
        }
        Ok(Self(raw))
    }

    /// Namespace prefix, empty for the default namespace
    pub fn prefix(&self) -> &str {
        self.0.split_once(':').map(|(p, _)| p).unwrap_or("")
    }

    /// Local part of the name
    pub fn local_name(&self) -> &str {
        self.0.split_once(':').map(|(_, l)| l).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Name {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        Name::new(s)
    }
}

impl TryFrom<String> for Name {
    type Error = RepositoryError;

    fn try_from(value: String) -> Result<Self> {
        Name::new(value)
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

/// Build a well-known name. Only for compile-time constants known to be valid.
pub(crate) fn well_known(raw: &'static str) -> Name {
    Name(raw.to_string())
}

/// One element of a [`Path`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElement {
    Root,
    Current,
    Parent,
    Named { name: Name, index: u32 },
}

impl PathElement {
    pub fn named(name: Name) -> Self {
        PathElement::Named { name, index: 1 }
    }

    pub fn name(&self) -> Option<&Name> {
        match self {
            PathElement::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            PathElement::Named { index, .. } => *index,
            _ => 1,
        }
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Root => Ok(()),
            PathElement::Current => f.write_str("."),
            PathElement::Parent => f.write_str(".."),
            PathElement::Named { name, index } if *index > 1 => write!(f, "{}[{}]", name, index),
            PathElement::Named { name, .. } => write!(f, "{}", name),
        }
    }
}

/// Absolute or relative path through the item hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    elements: Vec<PathElement>,
}

impl Path {
    /// The root path `/`
    pub fn root() -> Self {
        Self {
            elements: vec![PathElement::Root],
        }
    }

    /// Build a path from elements. `Root` may only appear first.
    pub fn from_elements(elements: Vec<PathElement>) -> Result<Self> {
        if elements.is_empty() {
            return Err(RepositoryError::MalformedPath("empty path".to_string()));
        }
        if elements.iter().skip(1).any(|e| *e == PathElement::Root) {
            return Err(RepositoryError::MalformedPath(
                "root element must be the first element".to_string(),
            ));
        }
        Ok(Self { elements })
    }

    /// A relative path of one name element
    pub fn from_name(name: Name) -> Self {
        Self {
            elements: vec![PathElement::named(name)],
        }
    }

    /// Parse a path literal
    pub fn parse(literal: &str) -> Result<Self> {
        if literal.is_empty() {
            return Err(RepositoryError::MalformedPath("no path literal specified".to_string()));
        }
        if literal == "/" {
            return Ok(Self::root());
        }

        let mut elements = Vec::new();
        let rest = match literal.strip_prefix('/') {
            Some(rest) => {
                elements.push(PathElement::Root);
                rest
            }
            None => literal,
        };

        for segment in rest.split('/') {
            elements.push(parse_element(segment, literal)?);
        }
        Ok(Self { elements })
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.elements.first() == Some(&PathElement::Root)
    }

    pub fn denotes_root(&self) -> bool {
        self.elements.len() == 1 && self.is_absolute()
    }

    /// Whether the path contains no `.` or `..` elements
    pub fn is_normalized(&self) -> bool {
        !self
            .elements
            .iter()
            .any(|e| matches!(e, PathElement::Current | PathElement::Parent))
    }

    /// Name of the last element, `None` for the root or `.`/`..`
    pub fn name(&self) -> Option<&Name> {
        self.elements.last().and_then(PathElement::name)
    }

    /// Last element
    pub fn last(&self) -> &PathElement {
        // never empty by construction
        &self.elements[self.elements.len() - 1]
    }

    /// Path of the parent, `None` for the root and single-element relative paths
    pub fn parent(&self) -> Option<Path> {
        if self.elements.len() < 2 {
            return None;
        }
        Some(Self {
            elements: self.elements[..self.elements.len() - 1].to_vec(),
        })
    }

    /// Append a name element
    pub fn child(&self, name: Name) -> Path {
        self.child_with_index(name, 1)
    }

    pub fn child_with_index(&self, name: Name, index: u32) -> Path {
        let mut elements = self.elements.clone();
        elements.push(PathElement::Named {
            name,
            index: index.max(1),
        });
        Self { elements }
    }

    /// Compose with a relative path
    pub fn join(&self, relative: &Path) -> Result<Path> {
        if relative.is_absolute() {
            return Err(RepositoryError::MalformedPath(format!(
                "cannot append absolute path '{}' to '{}'",
                relative, self
            )));
        }
        let mut elements = self.elements.clone();
        elements.extend(relative.elements.iter().cloned());
        Ok(Self { elements })
    }

    /// Resolve `.` and `..` elements
    pub fn normalize(&self) -> Result<Path> {
        let mut out: Vec<PathElement> = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            match element {
                PathElement::Current => {}
                PathElement::Parent => match out.last() {
                    Some(PathElement::Named { .. }) => {
                        out.pop();
                    }
                    Some(PathElement::Root) => {
                        return Err(RepositoryError::MalformedPath(format!(
                            "path '{}' cannot be normalized: '..' above root",
                            self
                        )));
                    }
                    _ => out.push(PathElement::Parent),
                },
                other => out.push(other.clone()),
            }
        }
        if out.is_empty() {
            out.push(PathElement::Current);
        }
        Ok(Self { elements: out })
    }

    /// Whether `self` is a proper ancestor of `other`. Both paths are
    /// normalized before comparing; mixed absolute/relative paths never match.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        let (Ok(a), Ok(b)) = (self.normalize(), other.normalize()) else {
            return false;
        };
        if a.is_absolute() != b.is_absolute() {
            return false;
        }
        a.elements.len() < b.elements.len() && b.elements.starts_with(&a.elements)
    }

    pub fn is_descendant_of(&self, other: &Path) -> bool {
        other.is_ancestor_of(self)
    }

    /// Number of named levels below the root, 0 for the root itself
    pub fn depth(&self) -> usize {
        self.elements.iter().filter(|e| e.name().is_some()).count()
    }
}

fn parse_element(segment: &str, literal: &str) -> Result<PathElement> {
    match segment {
        "" => Err(RepositoryError::MalformedPath(format!(
            "empty path element in '{}'",
            literal
        ))),
        "." => Ok(PathElement::Current),
        ".." => Ok(PathElement::Parent),
        _ => {
            let (raw_name, index) = match segment.find('[') {
                Some(open) => {
                    let close = segment.strip_suffix(']').ok_or_else(|| {
                        RepositoryError::MalformedPath(format!(
                            "invalid path element '{}' (missing ']')",
                            segment
                        ))
                    })?;
                    let index: u32 = close[open + 1..].parse().map_err(|_| {
                        RepositoryError::MalformedPath(format!(
                            "invalid index in path element '{}'",
                            segment
                        ))
                    })?;
                    if index == 0 {
                        return Err(RepositoryError::MalformedPath(format!(
                            "invalid path element '{}' (index is 1-based)",
                            segment
                        )));
                    }
                    (&segment[..open], index)
                }
                None => (segment, 1),
            };
            let name = Name::new(raw_name)
                .map_err(|e| RepositoryError::MalformedPath(format!("{} in '{}'", e, literal)))?;
            Ok(PathElement::Named { name, index })
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denotes_root() {
            return f.write_str("/");
        }
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", element)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self> {
        Path::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = RepositoryError;

    fn try_from(value: String) -> Result<Self> {
        Path::parse(&value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}
