//! CSV export of closed positions.

use crate::strategy::Position;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::path::{Path, PathBuf};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_time(time: NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Write `positions` to `closed_positions_YYYYMMDD-HHMMSS.csv` inside `dir`
/// and return the full path.
pub fn write_closed_positions(dir: &Path, positions: &[Position]) -> Result<PathBuf> {
    let filename = format!(
        "closed_positions_{}.csv",
        Local::now().format("%Y%m%d-%H%M%S")
    );
    let path = dir.join(filename);

    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("creating {}", path.display()))?;

    writer.write_record([
        "Symbol",
        "EntryPx",
        "ExitPx",
        "EntryTime",
        "ExitTime",
        "Qty",
        "Direction",
        "OrdID",
        "TiqsEntryOrdID",
        "TiqsExitOrdID",
        "Reason",
    ])?;

    for position in positions {
        writer.write_record([
            position.symbol.clone(),
            format!("{:.2}", position.entry_px),
            format!("{:.2}", position.exit_px),
            format_time(position.entry_time),
            position.exit_time.map(format_time).unwrap_or_default(),
            position.qty.to_string(),
            position.direction.to_string(),
            position.ord_id.clone(),
            position.tiqs_entry_ord_id.clone(),
            position.tiqs_exit_ord_id.clone(),
            position.reason.clone(),
        ])?;
    }

    writer.flush().context("flushing closed-positions csv")?;
    Ok(path)
}
