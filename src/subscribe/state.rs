#![expect(
    clippy::module_name_repetitions,
    reason = "State types deliberately include the module name for clarity"
)]

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::PRESENCE_SUFFIX;
use crate::types::State;

/// A subscribed channel or channel group.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionItem {
    pub name: String,
    /// Presence state reported for this entity, if any.
    pub state: Option<State>,
}

impl SubscriptionItem {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: None,
        }
    }
}

type Table = BTreeMap<String, SubscriptionItem>;

#[derive(Debug, Default)]
struct Tables {
    channels: Table,
    groups: Table,
    presence_channels: Table,
    presence_groups: Table,
}

/// Channels and groups that should currently be polled, read under one lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Entities {
    pub channels: Vec<String>,
    pub channel_groups: Vec<String>,
    pub state: State,
}

/// Source of truth for subscribed channels, groups and their presence state.
///
/// Names are kept sorted so request paths are stable across calls.
#[derive(Debug, Default)]
pub struct StateManager {
    tables: RwLock<Tables>,
}

impl StateManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `channels` and `groups`.
    ///
    /// A non-empty `state` replaces the state of every named entity; otherwise existing
    /// state is kept. With `with_presence` a shadow entry is added for each name.
    pub fn subscribe(
        &self,
        channels: &[String],
        groups: &[String],
        state: Option<&State>,
        with_presence: bool,
    ) {
        let state = state.filter(|state| !state.is_empty());
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let tables = &mut *tables;

        for (names, table, shadow) in [
            (channels, &mut tables.channels, &mut tables.presence_channels),
            (groups, &mut tables.groups, &mut tables.presence_groups),
        ] {
            for name in names {
                let item = table
                    .entry(name.clone())
                    .or_insert_with(|| SubscriptionItem::new(name));
                if let Some(state) = state {
                    item.state = Some(state.clone());
                }
                if with_presence {
                    shadow
                        .entry(name.clone())
                        .or_insert_with(|| SubscriptionItem::new(name));
                }
            }
        }
    }

    /// Remove `channels` and `groups` together with their shadow entries.
    pub fn unsubscribe(&self, channels: &[String], groups: &[String]) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        for name in channels {
            tables.channels.remove(name);
            tables.presence_channels.remove(name);
        }
        for name in groups {
            tables.groups.remove(name);
            tables.presence_groups.remove(name);
        }
    }

    /// Clear every table, returning the channels and groups that were subscribed.
    pub fn unsubscribe_all(&self) -> (Vec<String>, Vec<String>) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let removed = std::mem::take(&mut *tables);

        (
            removed.channels.into_keys().collect(),
            removed.groups.into_keys().collect(),
        )
    }

    /// Replace the state of already-subscribed entities. Unknown names are ignored.
    pub fn set_state(&self, channels: &[String], groups: &[String], state: &State) {
        let state = (!state.is_empty()).then(|| state.clone());
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let tables = &mut *tables;

        for (names, table) in [(channels, &mut tables.channels), (groups, &mut tables.groups)] {
            for name in names {
                if let Some(item) = table.get_mut(name) {
                    item.state.clone_from(&state);
                }
            }
        }
    }

    /// Subscribed channel names, followed by `<name>-pnpres` for every shadow entry.
    #[must_use]
    pub fn prepare_channel_list(&self, include_presence: bool) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        list(&tables.channels, &tables.presence_channels, include_presence)
    }

    #[must_use]
    pub fn prepare_group_list(&self, include_presence: bool) -> Vec<String> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        list(&tables.groups, &tables.presence_groups, include_presence)
    }

    /// Map of entity name to state for every channel or group that carries state.
    #[must_use]
    pub fn create_state_payload(&self) -> State {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        payload(&tables)
    }

    /// True when no channel and no group is subscribed. Shadow entries are not counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.channels.is_empty() && tables.groups.is_empty()
    }

    #[must_use]
    pub fn contains_channel(&self, name: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.channels.contains_key(name)
    }

    #[must_use]
    pub fn contains_group(&self, name: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.groups.contains_key(name)
    }

    /// Lists and state payload taken from a single consistent view of the tables.
    pub(crate) fn entities(&self, include_presence: bool) -> Entities {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);

        Entities {
            channels: list(&tables.channels, &tables.presence_channels, include_presence),
            channel_groups: list(&tables.groups, &tables.presence_groups, include_presence),
            state: payload(&tables),
        }
    }
}

fn list(table: &Table, shadow: &Table, include_presence: bool) -> Vec<String> {
    let mut names: Vec<String> = table.keys().cloned().collect();
    if include_presence {
        names.extend(shadow.keys().map(|name| format!("{name}{PRESENCE_SUFFIX}")));
    }
    names
}

fn payload(tables: &Tables) -> State {
    tables
        .channels
        .values()
        .chain(tables.groups.values())
        .filter_map(|item| {
            let state = item.state.as_ref().filter(|state| !state.is_empty())?;
            Some((item.name.clone(), serde_json::Value::Object(state.clone())))
        })
        .collect()
}
