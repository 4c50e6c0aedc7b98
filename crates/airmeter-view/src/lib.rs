//! Client core of the air meter viewer: one relay channel demultiplexed into
//! handlers that feed a store of subscribable cells, plus paginated history
//! fetched over HTTP.

pub mod channel;
pub mod config;
pub mod console;
pub mod handlers;
pub mod history;
pub mod live;
pub mod logging;
pub mod messages;
pub mod roster;
pub mod router;
pub mod store;

pub use channel::{Connection, Transport, TransportError, WsTransport};
pub use history::{FetchError, HistoryFetcher, HttpReadingSource, Page, ReadingSource};
pub use router::{CommandRouter, RouterError};
pub use store::Store;
