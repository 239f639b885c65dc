use std::error::Error;

use aether_log::{decode, gen_key_pair, Config, DecodeError, Level, Mode, Record, Xlog};
use tempfile::tempdir;

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::new(), |mut out, byte| {
        _ = write!(out, "{byte:02x}");
        out
    })
}

fn decoded_lines(
    path: &std::path::Path,
    secret_key: Option<aether_log::SecretKey>,
) -> Vec<String> {
    let mut lines = Vec::new();
    decode(path, secret_key, |text| {
        lines.push(text.to_string());
        Ok(())
    })
    .unwrap();
    lines
}

/// Entire process: write -> flush -> decode, in submission order.
#[test]
fn test_write_flush_decode() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let engine = Xlog::with_tracker(None);

    let config = Config::new(dir.path().join("logs"), "app").mode(Mode::Async);
    let handle = engine.new_instance(config, Some(Level::Debug)).unwrap();
    engine.set_console_log_open(handle, false);

    for body in ["a", "b", "c"] {
        let record = Record::builder().level(Level::Info).build();
        engine.write(handle, Some(&record), Some(body));
    }
    engine.flush_module("app", true);

    let files = engine.get_log_files("app");
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("app_") && name.ends_with(".xlog"), "unexpected name {name}");

    let lines = decoded_lines(&files[0], None);
    let a = lines.iter().position(|line| line.ends_with(" - a\n")).unwrap();
    let b = lines.iter().position(|line| line.ends_with(" - b\n")).unwrap();
    let c = lines.iter().position(|line| line.ends_with(" - c\n")).unwrap();
    assert!(a < b && b < c);

    engine.shutdown();
    Ok(())
}

/// A multi-line body keeps its first line inline and indents the continuation
/// lines.
#[test]
fn test_multiline_body() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let engine = Xlog::with_tracker(None);

    let config = Config::new(dir.path().join("logs"), "multi").mode(Mode::Sync);
    let handle = engine.new_instance(config, Some(Level::Verbose)).unwrap();
    engine.set_console_log_open(handle, false);

    let record = Record::builder().level(Level::Error).build();
    engine.write(handle, Some(&record), Some("line1\nline2\nline3"));

    let files = engine.get_log_files("multi");
    let lines = decoded_lines(&files[0], None);
    let trace = lines.iter().find(|line| line.contains(" - line1\n")).unwrap();
    assert!(trace.ends_with(" - line1\n    line2\n    line3\n"), "got: {trace:?}");

    engine.shutdown();
    Ok(())
}

/// Encrypted logs decode with the secret key and refuse to decode without it.
#[test]
fn test_encrypted_roundtrip() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let engine = Xlog::with_tracker(None);
    let (secret_key, public_key) = gen_key_pair();

    let config = Config::new(dir.path().join("logs"), "sec")
        .mode(Mode::Sync)
        .pub_key(hex(&public_key));
    let handle = engine.new_instance(config, Some(Level::Verbose)).unwrap();
    engine.set_console_log_open(handle, false);

    let record = Record::builder().level(Level::Info).tag("vault").build();
    engine.write(handle, Some(&record), Some("classified"));

    let files = engine.get_log_files("sec");
    assert_eq!(files.len(), 1);

    // The raw file must not leak the plaintext.
    let raw = std::fs::read(&files[0])?;
    assert!(!raw.windows(10).any(|window| window == b"classified"));

    let lines = decoded_lines(&files[0], Some(secret_key));
    assert!(lines.iter().any(|line| line.ends_with(" - classified\n")));
    assert!(lines.iter().any(|line| line.contains("I/vault")));

    let refused = decode(&files[0], None, |_| Ok(()));
    assert!(matches!(refused, Err(DecodeError::Blocks(_))));

    engine.shutdown();
    Ok(())
}

/// Uncompressed, unencrypted blocks decode as well (the framing alone carries
/// the records).
#[test]
fn test_plain_blocks() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let engine = Xlog::with_tracker(None);

    let config = Config::new(dir.path().join("logs"), "raw")
        .mode(Mode::Sync)
        .compress(false);
    let handle = engine.new_instance(config, Some(Level::Verbose)).unwrap();
    engine.set_console_log_open(handle, false);

    let record = Record::builder().level(Level::Warn).build();
    engine.write(handle, Some(&record), Some("uncompressed"));

    let files = engine.get_log_files("raw");
    let lines = decoded_lines(&files[0], None);
    assert!(lines.iter().any(|line| line.ends_with(" - uncompressed\n")));

    engine.shutdown();
    Ok(())
}
