//! Identity-keyed three-way partition of declared vs. observed entities

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An entity together with its identity
#[derive(Debug, Clone, PartialEq)]
pub struct Keyed<E> {
    pub id: String,
    pub entity: E,
}

/// An identity present on both sides whose values differ under `equals`
#[derive(Debug, Clone, PartialEq)]
pub struct Changed<E> {
    pub id: String,
    pub db: E,
    pub cloud: E,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diff<E> {
    pub db_only: Vec<Keyed<E>>,
    pub cloud_only: Vec<Keyed<E>>,
    pub changed: Vec<Changed<E>>,
    pub unchanged: usize,
}

/// Sizes of the three difference sets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffCounts {
    pub db_only: usize,
    pub cloud_only: usize,
    pub changed: usize,
}

impl DiffCounts {
    pub fn total(&self) -> usize {
        self.db_only + self.cloud_only + self.changed
    }
}

impl<E> Diff<E> {
    pub fn counts(&self) -> DiffCounts {
        DiffCounts {
            db_only: self.db_only.len(),
            cloud_only: self.cloud_only.len(),
            changed: self.changed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }
}

/// Partition both inventories by identity. Output is ordered by identity.
pub fn find_diff<E>(
    db: BTreeMap<String, E>,
    mut cloud: BTreeMap<String, E>,
    equals: impl Fn(&E, &E) -> bool,
) -> Diff<E> {
    let mut diff = Diff {
        db_only: Vec::new(),
        cloud_only: Vec::new(),
        changed: Vec::new(),
        unchanged: 0,
    };

    for (id, db_entity) in db {
        match cloud.remove(&id) {
            None => diff.db_only.push(Keyed {
                id,
                entity: db_entity,
            }),
            Some(cloud_entity) if equals(&db_entity, &cloud_entity) => diff.unchanged += 1,
            Some(cloud_entity) => diff.changed.push(Changed {
                id,
                db: db_entity,
                cloud: cloud_entity,
            }),
        }
    }
    diff.cloud_only = cloud
        .into_iter()
        .map(|(id, entity)| Keyed { id, entity })
        .collect();

    diff
}
