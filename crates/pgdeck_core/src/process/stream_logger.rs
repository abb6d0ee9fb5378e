//! Timestamped capture of a child's output stream.
//!
//! Each line becomes `YYMMDDHHMMSSmmm,<line>` (UTC) in the stream's log file, flushed as
//! soon as it is written so a poller can follow the job live.

use chrono::{NaiveDateTime, Utc};
use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};

/// File name of the captured stdout inside a job directory.
pub const OUT_FILE: &str = "out";

/// File name of the captured stderr inside a job directory.
pub const ERR_FILE: &str = "err";

/// Time stamp format of a captured line.
pub const LINE_STAMP_FORMAT: &str = "%y%m%d%H%M%S%3f";

const STAMP_LEN: usize = 15;

/// Which output stream of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Stdout => OUT_FILE,
            Self::Stderr => ERR_FILE,
        }
    }
}

/// `line` as it is stored in a stream log: stamped now and newline terminated.
pub fn stamp_line(line: &[u8]) -> Vec<u8> {
    let stamp = Utc::now().format(LINE_STAMP_FORMAT).to_string();
    let mut record = Vec::with_capacity(stamp.len() + line.len() + 2);
    record.extend_from_slice(stamp.as_bytes());
    record.push(b',');
    record.extend_from_slice(line);
    record.push(b'\n');
    record
}

/// Appends timestamped lines to one stream log file.
#[derive(Debug)]
pub struct StreamLogger {
    stream: OutputStream,
    file: File,
    lines: u64,
}

impl StreamLogger {
    /// Open the log file of `stream` inside `dir` for appending.
    pub async fn open(dir: &Path, stream: OutputStream) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(stream.file_name()))
            .await?;
        Ok(Self { stream, file, lines: 0 })
    }

    /// Lines written so far.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Write one line, without its terminator, stamped with the current time.
    pub async fn log(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(&stamp_line(line)).await?;
        self.file.flush().await?;
        self.lines += 1;
        Ok(())
    }

    /// Copy `reader` line by line until it is exhausted.
    pub async fn drain<R>(mut self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            self.log(strip_terminator(&buf)).await?;
        }
        self.file.sync_all().await?;
        tracing::debug!(stream = ?self.stream, lines = self.lines, "Stream drained");
        Ok(self.lines)
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// One captured line read back from a stream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub timestamp: NaiveDateTime,
    pub text: String,
}

impl OutputLine {
    /// Parse a `YYMMDDHHMMSSmmm,<line>` record. Invalid UTF-8 is replaced.
    pub fn parse(record: &[u8]) -> Option<Self> {
        let record = strip_terminator(record);
        if record.len() <= STAMP_LEN || record[STAMP_LEN] != b',' {
            return None;
        }
        let stamp = std::str::from_utf8(&record[..STAMP_LEN]).ok()?;
        let timestamp = NaiveDateTime::parse_from_str(stamp, LINE_STAMP_FORMAT).ok()?;
        let text = String::from_utf8_lossy(&record[STAMP_LEN + 1..]).into_owned();
        Some(Self { timestamp, text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[tokio::test]
    async fn test_drain_stamps_every_line_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StreamLogger::open(dir.path(), OutputStream::Stdout).await.unwrap();
        let input: &[u8] = b"one\r\ntwo\n\nthree";

        assert_eq!(logger.drain(input).await.unwrap(), 4);

        let raw = std::fs::read(dir.path().join(OUT_FILE)).unwrap();
        let lines: Vec<_> = raw.split_inclusive(|b| *b == b'\n').collect();
        assert_eq!(lines.len(), 4);

        let parsed: Vec<_> = lines.iter().map(|l| OutputLine::parse(l).unwrap()).collect();
        let texts: Vec<_> = parsed.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "", "three"]);
        assert!(parsed.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(lines[0][STAMP_LEN], b',');
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OutputLine::parse(b"hello").is_none());
        assert!(OutputLine::parse(b"24030907050100x,late").is_none());

        let line = OutputLine::parse(b"240309070501042,ok\n").unwrap();
        assert_eq!(line.text, "ok");
        assert_eq!(line.timestamp.nanosecond(), 42_000_000);
    }
}
