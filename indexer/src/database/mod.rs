//! Relational store for confirmed chain history

pub mod connection;
pub mod persistence;
pub mod queries;
pub mod schema;

pub use connection::Database;
pub use persistence::Persistence;
pub use queries::IndexedQueries;
pub use schema::ChainTables;
