//! Hierepo Core Library
//!
//! Client-side workspace layer for a hierarchical content repository:
//! - Item identifiers, names, paths and typed values
//! - Change logs of tree edits applied as one atomic batch
//! - Workspace operations (versioning, locking, cross-workspace copies)
//! - Local item state cache kept current by committed events
//! - Fan-out of local and external changes to internal listeners
//! - In-memory repository backend for tests and tooling

pub mod error;
pub mod name;
pub mod id;
pub mod value;
pub mod event;
pub mod operation;
pub mod changelog;
pub mod service;
pub mod state;
pub mod listeners;
pub mod config;
pub mod cache;
pub mod registry;
pub mod workspace;
pub mod memory;

mod dispatch;

pub use error::{RepositoryError, Result};
pub use name::{names, Name, Path, PathElement};
pub use id::{DefaultIdFactory, IdFactory, ItemId, NodeId, PropertyId};
pub use value::{PropertyType, QValue, ValuePayload};
pub use event::{Event, EventBundle, EventFilter, EventListener, EventType, InternalEventListener};
pub use operation::{MergeListener, Operation};
pub use changelog::ChangeLog;
pub use service::{
    Batch, ChildInfo, ImportUuidBehavior, LockInfo, NodeInfo, NodeTypeDefinition, Permission,
    PropertyInfo, RepositoryDescriptors, RepositoryService, SessionInfo,
};
pub use state::{ItemData, ItemState, ItemStatus, NodeData, PropertyData};
pub use listeners::ListenerRegistry;
pub use config::WorkspaceConfig;
pub use cache::WorkspaceItemStateCache;
pub use registry::{NamespaceRegistry, NodeTypeRegistry};
pub use workspace::WorkspaceManager;
pub use memory::{InMemoryRepositoryService, MemoryBatch};
