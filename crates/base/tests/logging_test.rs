use base::logging::{FileLogger, StdoutLogger, TeeLogger, format_record};
use log::Log;
use std::fs;

fn with_record(f: impl FnOnce(&log::Record)) {
    f(&log::RecordBuilder::new()
        .level(log::Level::Info)
        .target("test")
        .file(Some("trainer.rs"))
        .line(Some(42))
        .args(format_args!("epoch 3 val_loss 0.2100"))
        .build());
}

#[test]
fn test_stdout_logger_implements_log_trait() {
    let logger = StdoutLogger;
    let metadata = log::MetadataBuilder::new()
        .level(log::Level::Info)
        .target("test")
        .build();
    assert!(logger.enabled(&metadata));

    with_record(|record| logger.log(record));
    logger.flush();
}

#[test]
fn test_format_record_layout() {
    let mut line = String::new();
    with_record(|record| line = format_record(record));
    assert!(line.contains("[INFO]"));
    assert!(line.contains("trainer.rs:42"));
    assert!(line.ends_with("- epoch 3 val_loss 0.2100"));
}

#[test]
fn test_file_logger_writes_dated_file() {
    let test_dir = std::env::temp_dir().join(format!("tagging-log-test-{}-file", std::process::id()));
    let _ = fs::remove_dir_all(&test_dir);

    let logger = FileLogger::new(&test_dir).expect("create FileLogger");
    with_record(|record| logger.log(record));
    logger.flush();

    let log_path = test_dir.join(format!("{}.log", base::format_today()));
    let contents = fs::read_to_string(&log_path).expect("read log file");
    assert!(contents.contains("epoch 3 val_loss 0.2100"));
    assert!(contents.ends_with('\n'));

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn test_tee_logger_reaches_file() {
    let test_dir = std::env::temp_dir().join(format!("tagging-log-test-{}-tee", std::process::id()));
    let _ = fs::remove_dir_all(&test_dir);

    let logger = TeeLogger::new(&test_dir).expect("create TeeLogger");
    with_record(|record| logger.log(record));
    logger.flush();

    let log_path = test_dir.join(format!("{}.log", base::format_today()));
    assert!(fs::read_to_string(&log_path).expect("read log file").contains("val_loss"));

    fs::remove_dir_all(&test_dir).ok();
}
