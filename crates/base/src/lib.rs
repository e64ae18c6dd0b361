mod cancel;
pub use cancel::*;

pub mod logging;
pub use logging::{
    FileLogger, StdoutLogger, TeeLogger, format_timestamp, format_today, init_run_logger,
    init_stdout_logger,
};

// Re-export log so downstream crates can use base::log::*
pub use log;
