use crate::cache::{keys, Cache, CacheValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Solar-system IDs live in `[30_000_000, 40_000_000)`.
pub const SOLAR_SYSTEM_ID_MIN: u32 = 30_000_000;
pub const SOLAR_SYSTEM_ID_MAX: u32 = 40_000_000;

/// Wormhole systems occupy `[31_000_000, 32_000_000)` inside that range.
pub const WORMHOLE_ID_MIN: u32 = 31_000_000;
pub const WORMHOLE_ID_MAX: u32 = 32_000_000;

/// Character IDs live in `[90_000_000, 100_000_000_000)`.
pub const CHARACTER_ID_MIN: u64 = 90_000_000;
pub const CHARACTER_ID_MAX: u64 = 100_000_000_000;

pub fn is_solar_system_id(id: u32) -> bool {
    (SOLAR_SYSTEM_ID_MIN..SOLAR_SYSTEM_ID_MAX).contains(&id)
}

pub fn is_wormhole_id(id: u32) -> bool {
    (WORMHOLE_ID_MIN..WORMHOLE_ID_MAX).contains(&id)
}

pub fn is_character_id(id: u64) -> bool {
    (CHARACTER_ID_MIN..CHARACTER_ID_MAX).contains(&id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedSystem {
    pub solar_system_id: u32,
    pub name: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub class_title: Option<String>,
    #[serde(default)]
    pub statics: Vec<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl TrackedSystem {
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }

    /// Field-level last-writer-wins merge: required fields always replace,
    /// optional fields replace when the patch carries them.
    fn merge_from(&mut self, patch: TrackedSystem) {
        self.name = patch.name;
        if patch.custom_name.is_some() {
            self.custom_name = patch.custom_name;
        }
        if patch.class_title.is_some() {
            self.class_title = patch.class_title;
        }
        if !patch.statics.is_empty() {
            self.statics = patch.statics;
        }
        if patch.region_name.is_some() {
            self.region_name = patch.region_name;
        }
        self.metadata.extend(patch.metadata);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedCharacter {
    pub eve_id: u64,
    pub name: String,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u64>,
    #[serde(default)]
    pub online: Option<bool>,
}

impl TrackedCharacter {
    fn merge_from(&mut self, patch: TrackedCharacter) {
        self.name = patch.name;
        if patch.corporation_id.is_some() {
            self.corporation_id = patch.corporation_id;
        }
        if patch.alliance_id.is_some() {
            self.alliance_id = patch.alliance_id;
        }
        if patch.ship_type_id.is_some() {
            self.ship_type_id = patch.ship_type_id;
        }
        if patch.online.is_some() {
            self.online = patch.online;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Entity appended. `collection_was_empty` reports whether the tracked
    /// collection had any entries before this write; handlers use it for the
    /// first-run guard.
    Added { collection_was_empty: bool },
    AlreadyTracked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The entity was absent and has been inserted; callers treat this as an
    /// add.
    Inserted { collection_was_empty: bool },
}

/// Authoritative set of tracked systems and characters.
///
/// A view over the cache: every mutation maintains three keys per entity
/// (collection, per-entity, presence) so membership checks stay O(1) and the
/// collection stays deduplicated by numeric EVE ID. All three keys change in
/// one `get_and_update_many` call, so concurrent mutators serialise against
/// each other and readers can never observe the collection disagreeing with
/// the companion keys once a mutation returns.
#[derive(Debug, Clone)]
pub struct Registry {
    cache: Arc<Cache>,
}

impl Registry {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub fn is_tracked_system(&self, id: u32) -> bool {
        matches!(
            self.cache.get(&keys::tracked_system(id)),
            Some(CacheValue::Flag(true))
        )
    }

    pub fn is_tracked_character(&self, eve_id: u64) -> bool {
        matches!(
            self.cache.get(&keys::tracked_character(eve_id)),
            Some(CacheValue::Flag(true))
        )
    }

    pub fn list_tracked_systems(&self) -> Vec<TrackedSystem> {
        match self.cache.get(keys::SYSTEMS) {
            Some(CacheValue::Systems(systems)) => systems,
            _ => Vec::new(),
        }
    }

    pub fn list_tracked_characters(&self) -> Vec<TrackedCharacter> {
        match self.cache.get(keys::CHARACTERS) {
            Some(CacheValue::Characters(characters)) => characters,
            _ => Vec::new(),
        }
    }

    pub fn get_system(&self, id: u32) -> Option<TrackedSystem> {
        match self.cache.get(&keys::system(id)) {
            Some(CacheValue::System(system)) => Some(system),
            _ => None,
        }
    }

    pub fn get_character(&self, eve_id: u64) -> Option<TrackedCharacter> {
        match self.cache.get(&keys::character(eve_id)) {
            Some(CacheValue::Character(character)) => Some(character),
            _ => None,
        }
    }

    pub fn add_system(&self, system: TrackedSystem) -> AddOutcome {
        let id = system.solar_system_id;
        let entity_key = keys::system(id);
        let presence_key = keys::tracked_system(id);
        self.cache.get_and_update_many(
            &[keys::SYSTEMS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Systems(list)) => list,
                    _ => Vec::new(),
                };
                let was_empty = list.is_empty();
                let outcome = match list.iter().find(|s| s.solar_system_id == id) {
                    Some(existing) => {
                        // Already present: repair the companion keys from the
                        // collection rather than touching the row.
                        values[1] = Some(CacheValue::System(existing.clone()));
                        values[2] = Some(CacheValue::Flag(true));
                        AddOutcome::AlreadyTracked
                    }
                    None => {
                        list.push(system.clone());
                        values[1] = Some(CacheValue::System(system));
                        values[2] = Some(CacheValue::Flag(true));
                        AddOutcome::Added {
                            collection_was_empty: was_empty,
                        }
                    }
                };
                values[0] = Some(CacheValue::Systems(list));
                outcome
            },
        )
    }

    pub fn remove_system(&self, id: u32) -> bool {
        let entity_key = keys::system(id);
        let presence_key = keys::tracked_system(id);
        self.cache.get_and_update_many(
            &[keys::SYSTEMS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Systems(list)) => list,
                    _ => Vec::new(),
                };
                let before = list.len();
                list.retain(|s| s.solar_system_id != id);
                let removed = list.len() != before;
                values[0] = Some(CacheValue::Systems(list));
                values[1] = None;
                values[2] = None;
                removed
            },
        )
    }

    pub fn update_system(&self, patch: TrackedSystem) -> UpdateOutcome {
        let id = patch.solar_system_id;
        let entity_key = keys::system(id);
        let presence_key = keys::tracked_system(id);
        self.cache.get_and_update_many(
            &[keys::SYSTEMS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Systems(list)) => list,
                    _ => Vec::new(),
                };
                let was_empty = list.is_empty();
                let (outcome, stored) = match list.iter_mut().find(|s| s.solar_system_id == id) {
                    Some(existing) => {
                        existing.merge_from(patch);
                        (UpdateOutcome::Updated, existing.clone())
                    }
                    None => {
                        list.push(patch.clone());
                        (
                            UpdateOutcome::Inserted {
                                collection_was_empty: was_empty,
                            },
                            patch,
                        )
                    }
                };
                values[0] = Some(CacheValue::Systems(list));
                values[1] = Some(CacheValue::System(stored));
                values[2] = Some(CacheValue::Flag(true));
                outcome
            },
        )
    }

    pub fn add_character(&self, character: TrackedCharacter) -> AddOutcome {
        let id = character.eve_id;
        let entity_key = keys::character(id);
        let presence_key = keys::tracked_character(id);
        self.cache.get_and_update_many(
            &[keys::CHARACTERS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Characters(list)) => list,
                    _ => Vec::new(),
                };
                let was_empty = list.is_empty();
                let outcome = match list.iter().find(|c| c.eve_id == id) {
                    Some(existing) => {
                        values[1] = Some(CacheValue::Character(existing.clone()));
                        values[2] = Some(CacheValue::Flag(true));
                        AddOutcome::AlreadyTracked
                    }
                    None => {
                        list.push(character.clone());
                        values[1] = Some(CacheValue::Character(character));
                        values[2] = Some(CacheValue::Flag(true));
                        AddOutcome::Added {
                            collection_was_empty: was_empty,
                        }
                    }
                };
                values[0] = Some(CacheValue::Characters(list));
                outcome
            },
        )
    }

    pub fn remove_character(&self, eve_id: u64) -> bool {
        let entity_key = keys::character(eve_id);
        let presence_key = keys::tracked_character(eve_id);
        self.cache.get_and_update_many(
            &[keys::CHARACTERS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Characters(list)) => list,
                    _ => Vec::new(),
                };
                let before = list.len();
                list.retain(|c| c.eve_id != eve_id);
                let removed = list.len() != before;
                values[0] = Some(CacheValue::Characters(list));
                values[1] = None;
                values[2] = None;
                removed
            },
        )
    }

    pub fn update_character(&self, patch: TrackedCharacter) -> UpdateOutcome {
        let id = patch.eve_id;
        let entity_key = keys::character(id);
        let presence_key = keys::tracked_character(id);
        self.cache.get_and_update_many(
            &[keys::CHARACTERS, &entity_key, &presence_key],
            |values| {
                let mut list = match values[0].take() {
                    Some(CacheValue::Characters(list)) => list,
                    _ => Vec::new(),
                };
                let was_empty = list.is_empty();
                let (outcome, stored) = match list.iter_mut().find(|c| c.eve_id == id) {
                    Some(existing) => {
                        existing.merge_from(patch);
                        (UpdateOutcome::Updated, existing.clone())
                    }
                    None => {
                        list.push(patch.clone());
                        (
                            UpdateOutcome::Inserted {
                                collection_was_empty: was_empty,
                            },
                            patch,
                        )
                    }
                };
                values[0] = Some(CacheValue::Characters(list));
                values[1] = Some(CacheValue::Character(stored));
                values[2] = Some(CacheValue::Flag(true));
                outcome
            },
        )
    }

    /// Replace both populations from a map snapshot. Applied as a sequence
    /// of the single-entity atomic mutations, so the dual-index invariant
    /// holds at every step even while delta handlers run concurrently.
    pub fn load_snapshot(
        &self,
        mut systems: Vec<TrackedSystem>,
        mut characters: Vec<TrackedCharacter>,
    ) {
        dedupe_by_key(&mut systems, |s| u64::from(s.solar_system_id));
        dedupe_by_key(&mut characters, |c| c.eve_id);

        let stale_systems: Vec<u32> = self
            .list_tracked_systems()
            .iter()
            .map(|s| s.solar_system_id)
            .filter(|id| !systems.iter().any(|s| s.solar_system_id == *id))
            .collect();
        for id in stale_systems {
            self.remove_system(id);
        }
        for system in systems {
            self.update_system(system);
        }

        let stale_characters: Vec<u64> = self
            .list_tracked_characters()
            .iter()
            .map(|c| c.eve_id)
            .filter(|id| !characters.iter().any(|c| c.eve_id == *id))
            .collect();
        for id in stale_characters {
            self.remove_character(id);
        }
        for character in characters {
            self.update_character(character);
        }
    }
}

fn dedupe_by_key<T, K: Ord + Copy>(items: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut seen = std::collections::BTreeSet::new();
    // Keep the last occurrence of each ID: later snapshot rows win.
    let mut kept: Vec<T> = Vec::with_capacity(items.len());
    for item in items.drain(..).rev() {
        if seen.insert(key(&item)) {
            kept.push(item);
        }
    }
    kept.reverse();
    *items = kept;
}
