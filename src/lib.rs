//! # Tiqs AutoTrader
//!
//! An algorithmic trading runtime that hosts multiple user-defined
//! strategies against the Tiqs broker: it ingests the binary tick stream
//! over a persistent socket, fans ticks out to the strategies subscribed to
//! each instrument, materialises their declared entry/exit/cancel intents
//! into broker orders, and reconciles the asynchronous order-update stream
//! back into per-strategy position state.
//!
//! ## Architecture
//!
//! - `auth`: multi-step login (password, TOTP, app-token exchange)
//! - `broker`: authenticated REST surface and the in-memory mock
//! - `socket`: tick/order-update codecs and the reconnecting socket client
//! - `trader`: the dispatcher owning catalogs, fan-out and shutdown
//! - `strategy`: per-strategy event loops and position state
//! - `pricing`: Black-76 greeks and implied volatility
//! - `config`: file/env configuration

pub mod auth;
pub mod broker;
pub mod config;
pub mod pricing;
pub mod socket;
pub mod strategy;
pub mod trader;

pub use broker::{BrokerApi, MockBroker, TiqsClient};
pub use config::AppConfig;
pub use socket::{SocketClient, SocketConfig, Tick};
pub use strategy::{Direction, EntryOpts, ExitOpts, Position, PositionStatus, Strategy};
pub use trader::AutoTrader;
