use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize json")?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse json from {}", path.display()))
}

/// Append `value` as one compact JSON line.
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut line = serde_json::to_string(value).context("failed to serialize json line")?;
    line.push('\n');
    let mut file = open_append(path)?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append {}", path.display()))
}

/// Append `line` with every non-empty line prefixed by a wall-clock stamp.
pub fn append_history(path: &Path, line: &str) -> Result<()> {
    let mut file = open_append(path)?;
    let stamped = stamp_lines(line);
    file.write_all(stamped.as_bytes())
        .with_context(|| format!("failed to append {}", path.display()))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

pub fn stamp_lines(input: &str) -> String {
    let ts = Local::now().format("%H:%M:%S").to_string();
    let mut out = String::new();
    for segment in input.split_inclusive('\n') {
        let has_newline = segment.ends_with('\n');
        let content = segment.trim_end_matches('\n');
        if content.is_empty() {
            continue;
        }
        out.push_str(&format!("[{}] {}", ts, content));
        if has_newline {
            out.push('\n');
        }
    }
    if out.is_empty() && !input.trim().is_empty() {
        out.push_str(&format!("[{}] {}", ts, input.trim()));
    }
    out
}

/// Newest-first non-empty lines, at most `limit`.
pub fn read_lines_reverse(path: &Path, limit: usize) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut lines: Vec<String> = reader
        .lines()
        .map_while(Result::ok)
        .filter(|l| !l.trim().is_empty())
        .collect();
    lines.reverse();
    lines.truncate(limit);
    Ok(lines)
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Sample {
        name: String,
        value: i32,
    }

    #[test]
    fn write_and_read_json() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sample.json");
        let data = Sample {
            name: "breaker".to_string(),
            value: 3,
        };

        write_json(&path, &data).expect("write");
        let read: Sample = read_json(&path).expect("read");

        assert_eq!(read, data);
    }

    #[test]
    fn append_json_line_writes_one_record_per_line() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");

        for value in 0..3 {
            append_json_line(
                &path,
                &Sample {
                    name: "r".to_string(),
                    value,
                },
            )
            .expect("append");
        }

        let lines = read_lines_reverse(&path, 10).expect("read");
        assert_eq!(lines.len(), 3);
        let newest: Sample = serde_json::from_str(&lines[0]).expect("parse");
        assert_eq!(newest.value, 2);
    }

    #[test]
    fn append_history_stamps_each_line() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.log");

        append_history(&path, "first\n\nsecond\n").expect("append");

        let content = fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('[') && lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn stamp_lines_without_trailing_newline() {
        let out = stamp_lines("solo");
        assert!(out.ends_with("] solo"));
        assert!(!out.ends_with('\n'));
    }

    #[test]
    fn read_lines_reverse_respects_limit() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lines.txt");
        fs::write(&path, "line1\nline2\nline3\n").expect("write");

        let lines = read_lines_reverse(&path, 2).expect("read");

        assert_eq!(lines, vec!["line3", "line2"]);
    }

    #[test]
    fn ensure_dir_creates_nested_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a").join("b");

        ensure_dir(&path).expect("ensure");

        assert!(path.is_dir());
    }
}
