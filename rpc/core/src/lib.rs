pub mod api;
pub mod mock;
pub mod model;

pub use api::ChainClient;
pub use mock::MockChainClient;
pub use model::*;
