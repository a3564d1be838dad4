use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
    sync::Arc,
};

use serde::{
    de::{Error, Unexpected},
    Deserialize, Deserializer, Serialize, Serializer,
};

const PACKAGE_SEPARATOR: u8 = b'/';
const OBJECT_SEPARATOR: u8 = b':';
const SEPARATORS: [char; 2] = ['/', ':'];

/// Hierarchical path of an object in the asset namespace.
///
/// A path is a sequence of entries.
/// Package entries start with `/` and object entries start with `:`.
/// Packages may only be nested in packages, objects may be nested in both.
///
/// `/Textures:Stone.png:Mip0` names object `Mip0` owned by object `Stone.png`
/// that lives in package `Textures`.
///
/// Cheap to clone.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetPath {
    repr: Arc<str>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParsePathError {
    #[error("Path '{path}' must start with '/' or ':'")]
    MissingSeparator { path: String },

    #[error("Path '{path}' contains an entry with empty name")]
    EmptyName { path: String },

    #[error("Path '{path}' has a package entry nested in an object")]
    PackageInObject { path: String },

    #[error("Path '{path}' starts with an object entry")]
    ObjectAtRoot { path: String },

    #[error("Name '{name}' is empty or contains a path separator")]
    InvalidName { name: String },
}

impl Default for AssetPath {
    fn default() -> Self {
        AssetPath::empty()
    }
}

impl AssetPath {
    /// Returns empty path.
    /// It is the parent of every top-level package.
    pub fn empty() -> Self {
        AssetPath { repr: Arc::from("") }
    }

    /// Parses path from its string form.
    pub fn parse(s: &str) -> Result<Self, ParsePathError> {
        let mut seen_object = false;
        let mut rest = s;

        while let Some(&separator) = rest.as_bytes().first() {
            let is_package = match separator {
                PACKAGE_SEPARATOR => true,
                OBJECT_SEPARATOR => false,
                _ => {
                    return Err(ParsePathError::MissingSeparator { path: s.to_owned() });
                }
            };

            if !is_package && rest.len() == s.len() {
                return Err(ParsePathError::ObjectAtRoot { path: s.to_owned() });
            }

            if is_package && seen_object {
                return Err(ParsePathError::PackageInObject { path: s.to_owned() });
            }
            seen_object |= !is_package;

            let tail = &rest[1..];
            let end = tail.find(SEPARATORS).unwrap_or(tail.len());
            if end == 0 {
                return Err(ParsePathError::EmptyName { path: s.to_owned() });
            }
            rest = &tail[end..];
        }

        Ok(AssetPath { repr: Arc::from(s) })
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }

    pub fn is_empty(&self) -> bool {
        self.repr.is_empty()
    }

    /// Returns true if last entry of the path is a package entry.
    pub fn is_package(&self) -> bool {
        match self.last_separator() {
            None => false,
            Some(idx) => self.repr.as_bytes()[idx] == PACKAGE_SEPARATOR,
        }
    }

    /// Returns path one level up.
    /// Parent of a top-level package is the empty path.
    pub fn parent(&self) -> AssetPath {
        match self.last_separator() {
            None => AssetPath::empty(),
            Some(idx) => AssetPath {
                repr: Arc::from(&self.repr[..idx]),
            },
        }
    }

    /// Returns name of the last entry.
    pub fn name(&self) -> &str {
        match self.last_separator() {
            None => "",
            Some(idx) => &self.repr[idx + 1..],
        }
    }

    pub fn join_package(&self, name: &str) -> Result<AssetPath, ParsePathError> {
        check_name(name)?;
        if !self.is_empty() && !self.is_package() {
            return Err(ParsePathError::PackageInObject {
                path: format!("{}/{}", self.repr, name),
            });
        }
        Ok(AssetPath {
            repr: Arc::from(format!("{}/{}", self.repr, name)),
        })
    }

    pub fn join_object(&self, name: &str) -> Result<AssetPath, ParsePathError> {
        check_name(name)?;
        if self.is_empty() {
            return Err(ParsePathError::ObjectAtRoot {
                path: format!(":{}", name),
            });
        }
        Ok(AssetPath {
            repr: Arc::from(format!("{}:{}", self.repr, name)),
        })
    }

    /// Appends object entries written as `a:b:c` relative to this path.
    pub fn join_objects(&self, relative: &str) -> Result<AssetPath, ParsePathError> {
        relative
            .split(':')
            .try_fold(self.clone(), |path, name| path.join_object(name))
    }

    /// Returns path with all trailing object entries removed.
    pub fn package_path(&self) -> AssetPath {
        match self.repr.find(':') {
            None => self.clone(),
            Some(idx) => AssetPath {
                repr: Arc::from(&self.repr[..idx]),
            },
        }
    }

    /// Iterates over this path and all its non-empty ancestors, innermost first.
    pub fn ancestors(&self) -> impl Iterator<Item = AssetPath> {
        let first = (!self.is_empty()).then(|| self.clone());
        std::iter::successors(first, |path| {
            let parent = path.parent();
            (!parent.is_empty()).then_some(parent)
        })
    }

    /// Returns top-level object path of the object group this path belongs to.
    ///
    /// Walks up while parent is an object.
    /// Sub-objects of a resource share single source file
    /// named after the top-level object.
    pub fn base_resource_path(&self) -> AssetPath {
        let mut base = self.clone();
        loop {
            let parent = base.parent();
            if parent.is_empty() || parent.is_package() {
                return base;
            }
            base = parent;
        }
    }

    /// Converts path into relative file system path with `/` separators.
    ///
    /// `/Textures:Stone.png` becomes `Textures/Stone.png`.
    pub fn to_file_path_string(&self) -> String {
        self.repr.get(1..).unwrap_or("").replace(':', "/")
    }

    fn last_separator(&self) -> Option<usize> {
        self.repr.rfind(SEPARATORS)
    }
}

fn check_name(name: &str) -> Result<(), ParsePathError> {
    if name.is_empty() || name.contains(SEPARATORS) {
        return Err(ParsePathError::InvalidName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

impl FromStr for AssetPath {
    type Err = ParsePathError;

    #[inline(always)]
    fn from_str(s: &str) -> Result<Self, ParsePathError> {
        AssetPath::parse(s)
    }
}

impl Display for AssetPath {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl Debug for AssetPath {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.repr, f)
    }
}

impl Serialize for AssetPath {
    #[inline(always)]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.repr)
    }
}

struct AssetPathVisitor;

impl<'de> serde::de::Visitor<'de> for AssetPathVisitor {
    type Value = AssetPath;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an asset path string like \"/Package:Object\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<AssetPath, E>
    where
        E: Error,
    {
        AssetPath::parse(v).map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for AssetPath {
    #[inline(always)]
    fn deserialize<D>(deserializer: D) -> Result<AssetPath, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(AssetPathVisitor)
    }
}
