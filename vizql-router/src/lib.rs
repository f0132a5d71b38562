pub mod bounds;
pub mod client;
pub mod errors;
pub mod executor;

pub use bounds::ResourceBounds;
pub use client::{
    HttpOlapClient, KvClient, OlapClient, PgStreamClient, RawRows, RedisKvClient, StreamClient,
};
pub use errors::ExecutorError;
pub use executor::{dispatch, CancelSignal, StoreClients};
