//! Market-data socket: binary tick framing, order-update frames, persistent
//! connection with resubscription and ping-liveness.

mod client;
mod codec;

pub use client::{SocketClient, SocketConfig, CHANNEL_CAPACITY, SOCKET_URL};
pub use codec::{
    decode_order_update, decode_tick, is_order_update, OrderUpdate, SocketMessage, Tick,
    FULL_TICK_LENGTH, TICK_TIME_OFFSET,
};

#[cfg(test)]
pub(crate) use client::Command;
