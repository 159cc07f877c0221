//! Line reading for child output that may not be UTF-8.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Like [`tokio::io::Lines`], but invalid UTF-8 is replaced instead of
/// ending the stream.
///
/// Partial input survives a dropped `next_line` future, so the reader can
/// sit in a `select!` loop.
#[derive(Debug)]
pub struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> LossyLines<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next line without its `\n` or `\r\n`, or `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}
