//! Logger setup. Each rank writes JSON lines to its own file and duplicates
//! `Info` and above to stdout.

use flexi_logger::{json_format, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle};
use log::LevelFilter;

use crate::types::Rank;

/// Sets up logging for rank `rank`. Each rank logs to a separate file and to stdout.
///
/// The returned handle must be kept alive for as long as logging is needed.
pub fn setup_logging(rank: Rank) -> Result<LoggerHandle, FlexiLoggerError> {
    start(format!("rank{rank}"))
}

/// Sets up logging for a thread-backed group. All ranks share one process and
/// therefore one logger; the rank is part of every record's key-values instead.
pub fn setup_logging_local() -> Result<LoggerHandle, FlexiLoggerError> {
    start("local".into())
}

fn start(discriminant: String) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::with(LevelFilter::Debug)
        .format(json_format)
        .log_to_file(
            FileSpec::default()
                .discriminant(discriminant)
                .suppress_timestamp()
                .suffix("log.json"),
        )
        .duplicate_to_stdout(Duplicate::Info)
        .start()
}
