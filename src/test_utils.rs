use slog::Logger;
use sloggers::Build;

/// Returns a logger for use in tests.
///
/// Discards everything unless the `test_logger` feature is enabled, in which
/// case logs print to the terminal at debug level:
///
/// ```bash
/// cargo test --features test_logger
/// ```
pub fn test_logger() -> Logger {
    if cfg!(feature = "test_logger") {
        sloggers::terminal::TerminalLoggerBuilder::new()
            .level(sloggers::types::Severity::Debug)
            .build()
            .expect("Should build test_logger")
    } else {
        sloggers::null::NullLoggerBuilder
            .build()
            .expect("Should build null_logger")
    }
}
