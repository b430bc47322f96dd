pub mod config;
pub mod endpoint;
pub mod stream;

mod queue;

pub use endpoint::{ChannelEvent, ChannelRx, ChannelTx, RelayEndpoint, WebSocketEndpoint};
pub use stream::{RelayStream, StreamState};
