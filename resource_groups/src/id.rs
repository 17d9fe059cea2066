// Copyright 2026 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

///
/// The identity of a group within its tree: one name segment per ancestor, root first.
/// Equality and hashing are structural.
///
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResourceGroupId {
    segments: Vec<String>,
}

impl ResourceGroupId {
    pub(crate) fn new_root(name: &str) -> ResourceGroupId {
        ResourceGroupId {
            segments: vec![name.to_owned()],
        }
    }

    pub(crate) fn child(&self, name: &str) -> ResourceGroupId {
        let mut segments = self.segments.clone();
        segments.push(name.to_owned());
        ResourceGroupId { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// The final segment: the name of the group under its parent.
    pub fn name(&self) -> &str {
        self.segments
            .last()
            .expect("group ids always have at least one segment")
    }
}

impl fmt::Display for ResourceGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceGroupId;

    #[test]
    fn display_joins_segments() {
        let root = ResourceGroupId::new_root("global");
        let leaf = root.child("adhoc").child("alice");
        assert_eq!(root.to_string(), "global");
        assert_eq!(leaf.to_string(), "global.adhoc.alice");
        assert_eq!(leaf.name(), "alice");
        assert_eq!(leaf.segments().len(), 3);
    }

    #[test]
    fn equality_is_structural() {
        let a = ResourceGroupId::new_root("global").child("adhoc");
        let b = ResourceGroupId::new_root("global").child("adhoc");
        let c = ResourceGroupId::new_root("global").child("scheduled");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
