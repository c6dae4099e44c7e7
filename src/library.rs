use std::collections::BTreeMap;

use crate::ir::Class;

/// Named collection of classes, iterated in name order.
#[derive(Clone, Debug, Default)]
pub(crate) struct Library {
    pub(crate) name: String,
    classes: BTreeMap<String, Class>,
}

impl Library {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            classes: BTreeMap::new(),
        }
    }

    /// Insert `class`, returning the class it replaced.
    pub(crate) fn add(&mut self, class: Class) -> Option<Class> {
        self.classes.insert(class.name.clone(), class)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Class> {
        self.classes.remove(name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Class> {
        self.classes.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Class> {
        self.classes.get_mut(name)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.len()
    }
}

impl FromIterator<Class> for Library {
    fn from_iter<T: IntoIterator<Item = Class>>(iter: T) -> Self {
        let mut library = Library::default();
        for class in iter {
            library.add(class);
        }
        library
    }
}
