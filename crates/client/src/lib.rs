//! relaydock Client
//!
//! Client half of the relay: a reconnecting WebSocket channel and the stream
//! assembler that turns `assistant.chunk` payloads into renderable messages.

pub mod assembler;
pub mod channel;
pub mod transport;

pub use assembler::{AssemblerUpdate, StreamAssembler};
pub use channel::{
    Action, ChannelConfig, ChannelEvent, ChannelState, Clock, ManualClock, ReconnectingChannel,
    TokioClock, INVALID_SERVER_MESSAGE,
};
pub use transport::{spawn, ChannelHandle};
