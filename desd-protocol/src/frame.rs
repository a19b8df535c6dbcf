//! Framing layer: tab-delimited, LF-terminated UTF-8 lines.
//!
//! Each message is a non-empty sequence of fields joined by TAB and
//! terminated by a single LF. The first field is the decimal correlation
//! id; the second is the command or event name. Fields must not contain
//! TAB or LF and there is no escaping.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::FrameError;

/// Maximum accepted line length, delimiter included. Anything longer is a
/// framing error; the connection stays usable.
pub const MAX_LINE_LEN: usize = 64 * 1024;

const DELIMITER: u8 = b'\n';

/// One protocol message: correlation id plus the name-and-arguments fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    /// `fields[0]` is the command or event name, the rest are arguments.
    pub fields: Vec<String>,
}

impl Message {
    pub fn new<I, S>(id: u64, name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![name.to_string()];
        fields.extend(args.into_iter().map(Into::into));
        Message { id, fields }
    }

    pub fn name(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &[String] {
        self.fields.get(1..).unwrap_or(&[])
    }
}

/// True when `field` may travel on the wire as-is.
pub fn field_ok(field: &str) -> bool {
    !field.bytes().any(|b| b == b'\t' || b == b'\n')
}

/// Encode a message into one wire line, trailing LF included.
pub fn encode(msg: &Message) -> Result<String, FrameError> {
    if msg.fields.is_empty() || msg.fields[0].is_empty() {
        return Err(FrameError::MissingCommand);
    }
    for (index, field) in msg.fields.iter().enumerate() {
        if !field_ok(field) {
            // Index 0 on the wire is the correlation id.
            return Err(FrameError::ForbiddenByte { index: index + 1 });
        }
    }
    let mut line = String::with_capacity(24 + msg.fields.iter().map(|f| f.len() + 1).sum::<usize>());
    line.push_str(&msg.id.to_string());
    for field in &msg.fields {
        line.push('\t');
        line.push_str(field);
    }
    line.push('\n');
    Ok(line)
}

/// Parse one line (LF already stripped) into a message.
pub fn parse(line: &str) -> Result<Message, FrameError> {
    let mut parts = line.split('\t');
    let id_field = parts.next().unwrap_or("");
    if id_field.is_empty() || !id_field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FrameError::BadCorrelationId);
    }
    let id: u64 = id_field.parse().map_err(|_| FrameError::BadCorrelationId)?;
    let fields: Vec<String> = parts.map(str::to_string).collect();
    if fields.is_empty() || fields[0].is_empty() {
        return Err(FrameError::MissingCommand);
    }
    Ok(Message { id, fields })
}

/// Buffered message reader: one message per LF, capped at [`MAX_LINE_LEN`].
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            buf: Vec::with_capacity(256),
        }
    }

    /// Read the next message. `Ok(None)` is a clean EOF.
    pub async fn read_message(&mut self) -> Result<Option<Message>, FrameError> {
        self.buf.clear();
        loop {
            // Cap each read so an oversized line fails without being
            // buffered whole.
            let mut limited = (&mut self.inner).take((MAX_LINE_LEN + 1) as u64);
            let read = limited.read_until(DELIMITER, &mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Partial line at EOF: treat like a delimited line so the
                // peer's last words still parse.
                break;
            }
            if self.buf.len() > MAX_LINE_LEN {
                return Err(FrameError::LineTooLong);
            }
            if self.buf.last() == Some(&DELIMITER) {
                self.buf.pop();
                break;
            }
        }
        let line = std::str::from_utf8(&self.buf).map_err(|_| FrameError::NotUtf8)?;
        parse(line).map(Some)
    }
}

/// Message writer: emits whole encoded lines and flushes per send.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), FrameError> {
        let line = encode(msg)?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
