use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::method::{MethodRecord, UNRESOLVED};

/// Handle into an [`Inventory`]'s method arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(usize);

/// Class-level history of one source file inside a release.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassRecord {
    pub path: String,
    pub creation_date: Option<DateTime<Utc>>,
    /// Days relative to the release date, [`UNRESOLVED`] until computed
    pub age: i64,
    pub authors: BTreeSet<String>,
    pub revisions: i64,
    pub methods: Vec<MethodId>,
}

impl ClassRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            age: UNRESOLVED,
            ..Default::default()
        }
    }

    pub fn n_auth(&self) -> i64 {
        self.authors.len() as i64
    }
}

/// Classes of a release plus the method records attached to them.
///
/// Every method lives once in the arena. Classes refer to it by [`MethodId`]
/// and the global index maps `class#method` keys to the same handle, so a
/// label set through either path is seen by both.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    classes: BTreeMap<String, ClassRecord>,
    methods: Vec<MethodRecord>,
    by_key: HashMap<String, MethodId>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the class table without any methods.
    pub fn classes_only(&self) -> Self {
        let classes = self
            .classes
            .iter()
            .map(|(path, class)| {
                let mut class = class.clone();
                class.methods.clear();
                (path.clone(), class)
            })
            .collect();
        Self {
            classes,
            ..Default::default()
        }
    }

    /// Get or create the class record for `path`.
    pub fn class_entry(&mut self, path: &str) -> &mut ClassRecord {
        self.classes
            .entry(path.to_string())
            .or_insert_with(|| ClassRecord::new(path))
    }

    pub fn class(&self, path: &str) -> Option<&ClassRecord> {
        self.classes.get(path)
    }

    pub fn class_mut(&mut self, path: &str) -> Option<&mut ClassRecord> {
        self.classes.get_mut(path)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassRecord> {
        self.classes.values()
    }

    pub fn classes_mut(&mut self) -> impl Iterator<Item = &mut ClassRecord> {
        self.classes.values_mut()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Insert a record, merging by key (last write wins).
    ///
    /// A record whose `class_name` names a known class is attached to that
    /// class and takes its age, author count and revision count.
    pub fn insert_method(&mut self, mut record: MethodRecord) -> MethodId {
        let owner = self.classes.get_mut(&record.class_name);
        if let Some(class) = owner.as_deref() {
            record.age = class.age;
            record.n_auth = class.n_auth();
            record.nr = class.revisions;
        }

        let key = record.key();
        let id = match self.by_key.get(&key) {
            Some(&id) => {
                self.methods[id.0] = record;
                id
            }
            None => {
                let id = MethodId(self.methods.len());
                self.methods.push(record);
                self.by_key.insert(key, id);
                id
            }
        };

        if let Some(class) = owner
            && !class.methods.contains(&id)
        {
            class.methods.push(id);
        }
        id
    }

    pub fn method(&self, id: MethodId) -> &MethodRecord {
        &self.methods[id.0]
    }

    pub fn method_mut(&mut self, id: MethodId) -> &mut MethodRecord {
        &mut self.methods[id.0]
    }

    pub fn method_id(&self, key: &str) -> Option<MethodId> {
        self.by_key.get(key).copied()
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodRecord> {
        self.methods.iter()
    }

    /// Method handles attached to the class at `path`.
    pub fn methods_of(&self, path: &str) -> &[MethodId] {
        self.classes
            .get(path)
            .map(|c| c.methods.as_slice())
            .unwrap_or(&[])
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn set_all_buggy(&mut self, buggy: bool) {
        for m in &mut self.methods {
            m.buggy = buggy;
        }
    }

    pub fn buggy_count(&self) -> usize {
        self.methods.iter().filter(|m| m.buggy).count()
    }
}
