//! Workspace status plugin.
//!
//! Forwards `workspace.status.<id>` events for the workspaces a connection
//! subscribed to, holding back a "completed" transition until the
//! workspace's agent is actually running. A sampler task pushes resource
//! utilization for every active workspace on a fixed cadence.

mod plugin;

pub use plugin::{WorkspacePlugin, WorkspacePluginFactory, WorkspaceSettings};
