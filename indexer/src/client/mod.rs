//! Access to chain nodes

pub mod access;
pub mod caching;
pub mod node;

pub use access::ChainAccessFacade;
pub use caching::CachingClient;
pub use node::NodeClient;
