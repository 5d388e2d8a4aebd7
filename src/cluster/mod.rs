//! Membership and messaging services consumed by the topology core

pub mod transport;
pub mod view;

pub use transport::Transport;
pub use view::{ClusterView, ViewTracker};
