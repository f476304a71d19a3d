// Copyright (c) 2019 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Decides which Lambda archives a layer tar entry belongs in.

use tar::EntryType;

use crate::error::{RepackError, Result};

/// Files under this prefix are packaged into Lambda layers, which the
/// runtime mounts at `/opt`.
pub const LAYER_PREFIX: &str = "opt/";

/// Files under this prefix are packaged into the function deployment
/// package, which the runtime unpacks into `/var/task`.
pub const FUNCTION_PREFIX: &str = "var/task/";

const WHITEOUT_PREFIX: &str = ".wh.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Target {
    Layer,
    Function,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Layer, Target::Function];

    pub fn prefix(self) -> &'static str {
        match self {
            Target::Layer => LAYER_PREFIX,
            Target::Function => FUNCTION_PREFIX,
        }
    }
}

/// One archive an entry is written to, with the name it gets there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub target: Target,
    pub name: String,
}

/// Every placement for an entry. Empty means the entry is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub placements: Vec<Placement>,
}

impl Classification {
    pub fn is_irrelevant(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn contains(&self, target: Target) -> bool {
        self.placements.iter().any(|p| p.target == target)
    }

    #[cfg(test)]
    pub fn name_for(&self, target: Target) -> Option<&str> {
        self.placements
            .iter()
            .find(|p| p.target == target)
            .map(|p| p.name.as_str())
    }
}

pub fn classify(path: &str, entry_type: EntryType) -> Result<Classification> {
    match entry_type {
        EntryType::Directory | EntryType::XGlobalHeader => return Ok(Classification::default()),
        _ => {}
    }

    if is_whiteout(path) {
        return Ok(Classification::default());
    }

    if !is_supported(entry_type) {
        return Err(RepackError::UnsupportedEntryType {
            path: path.to_string(),
            flag: entry_type.as_byte() as char,
        });
    }

    let normalized = normalize(path);
    let placements = Target::ALL
        .iter()
        .filter_map(|&target| {
            strip_reserved(normalized, target.prefix()).map(|name| Placement {
                target,
                name: name.to_string(),
            })
        })
        .collect();

    Ok(Classification { placements })
}

fn is_supported(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::Regular
            | EntryType::Continuous
            | EntryType::Link
            | EntryType::Symlink
            | EntryType::Char
            | EntryType::Block
            | EntryType::Fifo
    )
}

/// Overlay filesystems record deletions as empty files named `.wh.<name>`.
fn is_whiteout(path: &str) -> bool {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .is_some_and(|base| base.starts_with(WHITEOUT_PREFIX))
}

pub(crate) fn normalize(path: &str) -> &str {
    let mut p = path;
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest;
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest;
        } else {
            return p;
        }
    }
}

fn strip_reserved<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_path_is_rewritten() {
        let c = classify("opt/a/b", EntryType::Regular).unwrap();
        assert_eq!(c.name_for(Target::Layer), Some("a/b"));
        assert!(!c.contains(Target::Function));
    }

    #[test]
    fn test_function_path_is_rewritten() {
        let c = classify("var/task/x", EntryType::Regular).unwrap();
        assert_eq!(c.name_for(Target::Function), Some("x"));
        assert!(!c.contains(Target::Layer));
    }

    #[test]
    fn test_leading_dot_slash_is_ignored() {
        let c = classify("./opt/bin/php", EntryType::Symlink).unwrap();
        assert_eq!(c.name_for(Target::Layer), Some("bin/php"));
    }

    #[test]
    fn test_paths_outside_reserved_prefixes_are_irrelevant() {
        for path in ["local/hello", "optional/file", "var/tasks/x", "opt", "var/task/"] {
            assert!(classify(path, EntryType::Regular).unwrap().is_irrelevant(), "{}", path);
        }
    }

    #[test]
    fn test_directories_are_irrelevant() {
        assert!(classify("opt/lib/", EntryType::Directory)
            .unwrap()
            .is_irrelevant());
    }

    #[test]
    fn test_whiteouts_are_irrelevant_at_any_depth() {
        for path in [".wh.foo", "opt/.wh.foo", "opt/lib/.wh.foo", "var/task/.wh..wh..opq"] {
            assert!(classify(path, EntryType::Regular).unwrap().is_irrelevant(), "{}", path);
        }
    }

    #[test]
    fn test_global_header_is_irrelevant() {
        assert!(classify("pax_global_header", EntryType::XGlobalHeader)
            .unwrap()
            .is_irrelevant());
    }

    #[test]
    fn test_devices_and_links_are_supported() {
        for ty in [
            EntryType::Link,
            EntryType::Char,
            EntryType::Block,
            EntryType::Fifo,
        ] {
            assert!(classify("opt/dev", ty).unwrap().contains(Target::Layer));
        }
    }

    #[test]
    fn test_unsupported_type_names_path_and_flag() {
        let err = classify("opt/volume", EntryType::new(b'V')).unwrap_err();
        match err {
            RepackError::UnsupportedEntryType { ref path, flag } => {
                assert_eq!(path, "opt/volume");
                assert_eq!(flag, 'V');
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
