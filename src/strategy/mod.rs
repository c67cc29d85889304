//! Strategy runtime: declarative entry/exit/cancel intents, a bounded close
//! series, and reconciliation of broker order echoes into position state.

mod runtime;
mod types;

pub use runtime::{OnTickFn, Strategy};
pub use types::{
    CloseSeries, Direction, EntryOpts, ExitOpts, Position, PositionStatus, BARS_MAX_LEN,
};
