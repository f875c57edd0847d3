//! Live feed: fans committed message events out to WebSocket listeners.

pub mod connection;
pub mod dispatcher;

pub use dispatcher::{Dispatcher, FeedFrame};
