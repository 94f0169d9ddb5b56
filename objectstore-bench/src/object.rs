//! The inventory of objects created by the prepare phase.

use std::ops::Index;
use std::sync::Arc;

/// An object that has been uploaded to the storage service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectInfo {
    /// The full key of the object.
    pub name: String,
    /// The prefix below which the object was created.
    pub prefix: String,
    /// The size of the object in bytes.
    pub size: u64,
    /// The content type the object was uploaded with.
    pub content_type: String,
    /// The version assigned by the storage service, if the bucket is versioned.
    pub version_id: Option<String>,
}

/// A frozen, cheaply clonable inventory of uploaded objects.
///
/// Workers share the inventory and address entries by index; it is never mutated after the
/// prepare phase.
#[derive(Clone, Debug, Default)]
pub struct Objects(Arc<[ObjectInfo]>);

impl Objects {
    /// Returns the number of objects.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no objects.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the object at the given index.
    pub fn get(&self, index: usize) -> Option<&ObjectInfo> {
        self.0.get(index)
    }

    /// Iterates over all objects.
    pub fn iter(&self) -> std::slice::Iter<'_, ObjectInfo> {
        self.0.iter()
    }

    /// Returns the distinct prefixes of all objects, in the order they were first seen.
    pub fn prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = Vec::new();
        for object in self.0.iter() {
            if !prefixes.contains(&object.prefix.as_str()) {
                prefixes.push(&object.prefix);
            }
        }
        prefixes
    }

    /// Iterates over the objects created below the given prefix.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ObjectInfo> {
        self.0.iter().filter(move |object| object.prefix == prefix)
    }
}

impl Index<usize> for Objects {
    type Output = ObjectInfo;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<ObjectInfo>> for Objects {
    fn from(objects: Vec<ObjectInfo>) -> Self {
        Self(objects.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(prefix: &str, name: &str) -> ObjectInfo {
        ObjectInfo {
            name: format!("{prefix}/{name}"),
            prefix: prefix.into(),
            size: 1,
            content_type: "application/octet-stream".into(),
            version_id: None,
        }
    }

    #[test]
    fn prefixes_are_distinct_and_ordered() {
        let objects = Objects::from(vec![
            object("b", "1"),
            object("a", "2"),
            object("b", "3"),
            object("c", "4"),
        ]);

        assert_eq!(objects.prefixes(), vec!["b", "a", "c"]);
        assert_eq!(objects.with_prefix("b").count(), 2);
        assert_eq!(objects[1].name, "a/2");
    }
}
