//! Change events and listener interfaces

use crate::changelog::ChangeLog;
use crate::id::{ItemId, NodeId};
use crate::name::{Name, Path};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change an [`Event`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    NodeAdded,
    NodeRemoved,
    PropertyAdded,
    PropertyRemoved,
    PropertyChanged,
}

/// Mask matching every event type
pub const ALL_TYPES: u32 = 0b1_1111;

impl EventType {
    pub const fn mask(self) -> u32 {
        match self {
            EventType::NodeAdded => 1,
            EventType::NodeRemoved => 2,
            EventType::PropertyAdded => 4,
            EventType::PropertyRemoved => 8,
            EventType::PropertyChanged => 16,
        }
    }

    pub fn concerns_node(self) -> bool {
        matches!(self, EventType::NodeAdded | EventType::NodeRemoved)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::NodeAdded => "NodeAdded",
            EventType::NodeRemoved => "NodeRemoved",
            EventType::PropertyAdded => "PropertyAdded",
            EventType::PropertyRemoved => "PropertyRemoved",
            EventType::PropertyChanged => "PropertyChanged",
        };
        f.write_str(s)
    }
}

/// One observable change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    /// The item that changed
    pub item_id: ItemId,
    /// Parent of the changed item
    pub parent_id: Option<NodeId>,
    /// Absolute path of the changed item, if known
    pub path: Option<Path>,
    /// User whose session caused the change
    pub user_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, item_id: ItemId, parent_id: Option<NodeId>) -> Self {
        Self {
            event_type,
            item_id,
            parent_id,
            path: None,
            user_id: None,
        }
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{} {}", self.event_type, path),
            None => write!(f, "{} {}", self.event_type, self.item_id),
        }
    }
}

/// Filter passed to the backend when registering an [`EventListener`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Bit mask of [`EventType::mask`] values
    pub event_types: u32,
    /// Whether changes below the registration root are included
    pub is_deep: bool,
    /// Drop events caused by the registering session
    pub no_local: bool,
    /// Only events on nodes with these unique ids
    pub unique_ids: Option<Vec<String>>,
    /// Only events on nodes of these types
    pub node_type_names: Option<Vec<Name>>,
}

impl EventFilter {
    /// All event types on the whole tree, including the session's own changes
    pub fn all() -> Self {
        Self {
            event_types: ALL_TYPES,
            is_deep: true,
            no_local: false,
            unique_ids: None,
            node_type_names: None,
        }
    }

    pub fn excluding_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn accepts_type(&self, event_type: EventType) -> bool {
        self.event_types & event_type.mask() != 0
    }
}

/// A delivered event sequence
///
/// `change_log` is set only when the events result from executing a change
/// log; workspace operations and external changes carry none.
#[derive(Debug, Clone, Copy)]
pub struct EventBundle<'a> {
    events: &'a [Event],
    is_local: bool,
    change_log: Option<&'a ChangeLog>,
}

impl<'a> EventBundle<'a> {
    pub fn new(events: &'a [Event], is_local: bool, change_log: Option<&'a ChangeLog>) -> Self {
        Self {
            events,
            is_local,
            change_log,
        }
    }

    pub fn events(&self) -> &'a [Event] {
        self.events
    }

    /// Whether the changes were caused by this session
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn change_log(&self) -> Option<&'a ChangeLog> {
        self.change_log
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Consumer of committed local and external changes
pub trait InternalEventListener: Send + Sync {
    fn on_event(&self, bundle: &EventBundle<'_>);
}

/// Listener registered with the backend for changes it pushes on its own
pub trait EventListener: Send + Sync {
    fn on_event(&self, events: Vec<Event>);
}
