use lockbox_logger::{LevelFilter, Logger};
use serial_test::serial;
use std::fs;
use tempfile::tempdir;

#[test]
#[serial]
fn json_file_logging_writes_structured_lines() -> Result<(), Box<dyn std::error::Error>> {
    let tmp_dir = tempdir()?;
    let log_dir = tmp_dir.path().join("logs");

    let logger = Logger::builder()
        .name("lockbox-file-logging")
        .console(false)
        .level(LevelFilter::DEBUG)
        .directory(&log_dir)
        .json(true)
        .init()?;
    assert!(logger.writes_files());

    tracing::debug!(key = "cert/example.com", "Lock obtained");
    drop(logger);

    let log_file = fs::read_dir(&log_dir)?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .expect("log file should be created");

    let contents = fs::read_to_string(&log_file)?;
    let line = contents.lines().find(|l| l.contains("Lock obtained")).expect("event should be logged");
    assert!(line.starts_with('{'), "file output should be JSON: {line}");
    assert!(line.contains("\"key\":\"cert/example.com\""));

    Ok(())
}
