//! Request resolution tree.
//!
//! Requests addressed like `site.telescope.rightascension` descend a tree of
//! components. Brokers route on address segments, providers consume them,
//! filters (cache, conditional freezer, access gate) either answer locally or
//! delegate downward, and terminal nodes (access grantor, hardware adapter)
//! produce values. The shared [`component::TreeData`] record, distributed
//! during post-init, gives every node a way back to the root resolver and to
//! the pub/sub connection.

pub mod access;
pub mod alpaca;
pub mod broker;
pub mod cache;
pub mod component;
pub mod freezer;
pub mod grantor;
pub mod internal;
pub mod provider;
pub mod resources;
pub mod testing;

pub use access::TreeRequestBlocker;
pub use alpaca::TreeAlpacaObservatory;
pub use broker::{TreeBroker, TreeBrokerDefaultTarget, TreeNamedBroker};
pub use cache::TreeCache;
pub use component::{
    DynAddressed, DynComponent, ProvidesResponse, TreeData, ValueOutcome,
};
pub use freezer::TreeConditionalFreezer;
pub use grantor::TreeAccessGrantor;
pub use internal::{InternalClient, InternalRequests, Publisher};
pub use provider::TreeProvider;
