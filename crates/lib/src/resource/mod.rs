//! Resource declaration model.
//!
//! Resources are declared into a [`ResourceTable`], validated against the
//! static schema of their [`ResourceKind`], and handed to the engine.

mod schema;
mod table;
mod types;

pub use schema::{AttrSpec, AttrType, DefaultValue, KindSchema, parse_mode, schema_for, validate};
pub use table::{ResourceHandle, ResourceTable, SubResourceHandle};
pub(crate) use table::owned_service_names;
pub use types::{
  Action, AttrValue, Attributes, Guard, NotifyDecl, Resource, ResourceId, ResourceKind, ResourceState,
};
