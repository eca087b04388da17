//! Stanza boundary extraction from the raw socket byte stream.
//!
//! The server never announces stanza lengths, so boundaries are found by
//! tracking element depth with quick-xml. The framer keeps its own stack of
//! open element names and resumes each scan after the last complete markup
//! event, so bytes of a partial stanza are parsed once. A scan is only
//! attempted once a `>` has arrived past the previous scan.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, trace};

use crate::error::FramingError;

/// Maximum bytes a single stanza may occupy before the connection is dropped.
pub const MAX_STANZA_SIZE: usize = 1024 * 1024;

/// Tags that tear down the whole stream when seen outside a stanza.
const STREAM_CLOSE_TAGS: [&[u8]; 2] = [b"k", b"stream:stream"];

/// Outcome of one [`Framer::next_frame`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// More bytes are needed.
    Incomplete,
    /// Exact bytes of one complete top-level stanza.
    Stanza(Vec<u8>),
    /// The peer closed the stream.
    StreamClosed,
}

/// What the framer expects next from the stream.
#[derive(Debug, Clone, Copy, PartialEq)]
enum FramerState {
    /// The first element must be the `<k>` handshake response.
    AwaitingHandshake,
    /// Between or inside ordinary stanzas.
    Stanzas,
    /// A stream close was returned; nothing more will be framed.
    Closed,
}

/// Incremental, never-rewinding stanza framer.
#[derive(Debug)]
pub struct Framer {
    buffer: Vec<u8>,
    /// Buffer length at the last scan that came back incomplete.
    scanned: usize,
    /// Offset just past the last complete markup event.
    resume_at: usize,
    /// Names of the elements open in the pending stanza, outermost first.
    open: Vec<Vec<u8>>,
    /// Offset of the pending stanza's root start tag, valid while `open` is non-empty.
    stanza_start: usize,
    max_stanza_size: usize,
    state: FramerState,
}

/// Result of scanning the unread part of the buffer once.
enum Scan {
    Incomplete,
    Stanza { start: usize, end: usize },
    StreamClosed { end: usize },
}

/// What an end tag did to the open-element stack.
enum Closed {
    Inner,
    Stanza,
    Stream,
}

impl Framer {
    /// Framer for a stream that is already past the handshake.
    pub fn new(max_stanza_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            resume_at: 0,
            open: Vec::new(),
            stanza_start: 0,
            max_stanza_size,
            state: FramerState::Stanzas,
        }
    }

    /// Framer for a fresh connection whose first frame must be the `<k>` handshake.
    pub fn with_handshake(max_stanza_size: usize) -> Self {
        Self {
            state: FramerState::AwaitingHandshake,
            ..Self::new(max_stanza_size)
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next frame, if the buffer holds one.
    ///
    /// Call repeatedly after each [`feed`](Self::feed) until it returns
    /// [`Frame::Incomplete`]: a single read may carry several stanzas.
    pub fn next_frame(&mut self) -> Result<Frame, FramingError> {
        if self.state == FramerState::Closed {
            return Ok(Frame::StreamClosed);
        }

        let from = self.scanned.max(self.resume_at);
        if !self.buffer[from..].contains(&b'>') {
            if self.open.is_empty() {
                let filler = self.buffer[self.resume_at..]
                    .iter()
                    .take_while(|b| b.is_ascii_whitespace())
                    .count();
                self.buffer.drain(self.resume_at..self.resume_at + filler);
            }
            self.scanned = self.buffer.len();
            self.check_size(self.buffer.len())?;
            return Ok(Frame::Incomplete);
        }

        match self.scan()? {
            Scan::Incomplete => {
                self.discard_filler();
                self.scanned = self.buffer.len();
                self.check_size(self.buffer.len())?;
                Ok(Frame::Incomplete)
            }
            Scan::Stanza { start, end } => {
                self.check_size(end - start)?;
                let stanza = self.buffer[start..end].to_vec();
                self.consume(end);
                if self.state == FramerState::AwaitingHandshake {
                    self.state = FramerState::Stanzas;
                }
                trace!(len = stanza.len(), remaining = self.buffer.len(), "Framed stanza");
                Ok(Frame::Stanza(stanza))
            }
            Scan::StreamClosed { end } => {
                self.consume(end);
                self.state = FramerState::Closed;
                debug!("Peer closed the stream");
                Ok(Frame::StreamClosed)
            }
        }
    }

    fn check_size(&self, size: usize) -> Result<(), FramingError> {
        if size > self.max_stanza_size {
            return Err(FramingError::Oversized {
                size,
                max: self.max_stanza_size,
            });
        }
        Ok(())
    }

    /// Drop everything up to and including `end` and start the next stanza fresh.
    fn consume(&mut self, end: usize) {
        self.buffer.drain(..end);
        self.scanned = 0;
        self.resume_at = 0;
        self.stanza_start = 0;
        self.open.clear();
    }

    /// Drop filler before the pending stanza, keeping the parse position.
    fn discard_filler(&mut self) {
        let keep_from = if self.open.is_empty() {
            self.resume_at
        } else {
            self.stanza_start
        };
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.resume_at -= keep_from;
        self.stanza_start = 0;
    }

    /// Continue parsing from `resume_at` until a stanza or stream close completes.
    fn scan(&mut self) -> Result<Scan, FramingError> {
        let base = self.resume_at;
        let mut reader = Reader::from_reader(&self.buffer[base..]);
        reader.config_mut().trim_text(false);
        // The reader only sees the tail of the pending stanza, so end tags are
        // matched against `open` here instead.
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        loop {
            let pos = base + reader.buffer_position() as usize;
            let event = reader.read_event();
            let end = base + reader.buffer_position() as usize;

            match event {
                Ok(Event::DocType(_)) => return Err(FramingError::DtdForbidden),
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => {}
                Ok(Event::Text(text)) => {
                    if self.open.is_empty() && !text.iter().all(u8::is_ascii_whitespace) {
                        return Err(FramingError::Syntax(format!(
                            "text outside of a stanza at offset {}",
                            pos
                        )));
                    }
                }
                Ok(Event::CData(_)) => {
                    if self.open.is_empty() {
                        return Err(FramingError::Syntax(format!(
                            "CDATA outside of a stanza at offset {}",
                            pos
                        )));
                    }
                }
                Ok(Event::Start(e)) => {
                    if self.open.is_empty() {
                        self.stanza_start = pos;
                        if self.state == FramerState::AwaitingHandshake {
                            check_handshake_name(&e)?;
                            if is_accepted_handshake(&e) {
                                return Ok(Scan::Stanza { start: pos, end });
                            }
                        }
                    }
                    self.open.push(e.name().as_ref().to_vec());
                }
                Ok(Event::Empty(e)) => {
                    if self.open.is_empty() {
                        if self.state == FramerState::AwaitingHandshake {
                            check_handshake_name(&e)?;
                        }
                        return Ok(Scan::Stanza { start: pos, end });
                    }
                }
                Ok(Event::End(e)) => match close_element(&mut self.open, e.name().as_ref())? {
                    Closed::Inner => {}
                    Closed::Stanza => {
                        return Ok(Scan::Stanza {
                            start: self.stanza_start,
                            end,
                        })
                    }
                    Closed::Stream => return Ok(Scan::StreamClosed { end }),
                },
                Ok(Event::Eof) => return Ok(Scan::Incomplete),
                Err(quick_xml::Error::Syntax(err)) if is_truncation(&err, &self.buffer[pos..]) => {
                    // The tail of the buffer is a markup construct cut by the
                    // read boundary; the next read completes it.
                    return Ok(Scan::Incomplete);
                }
                Err(e) => return Err(FramingError::Syntax(e.to_string())),
            }

            self.resume_at = end;
        }
    }
}

/// Pop `name` off the open-element stack.
fn close_element(open: &mut Vec<Vec<u8>>, name: &[u8]) -> Result<Closed, FramingError> {
    let Some(expected) = open.pop() else {
        if STREAM_CLOSE_TAGS.contains(&name) {
            return Ok(Closed::Stream);
        }
        return Err(FramingError::Syntax(format!(
            "unmatched end tag </{}>",
            String::from_utf8_lossy(name)
        )));
    };
    if expected != name {
        return Err(FramingError::MismatchedClose {
            expected: String::from_utf8_lossy(&expected).into_owned(),
            found: String::from_utf8_lossy(name).into_owned(),
        });
    }
    Ok(if open.is_empty() {
        Closed::Stanza
    } else {
        Closed::Inner
    })
}

/// True when a syntax error only means the buffer ends inside a construct.
fn is_truncation(err: &SyntaxError, tail: &[u8]) -> bool {
    if matches!(
        err,
        SyntaxError::UnclosedTag
            | SyntaxError::UnclosedComment
            | SyntaxError::UnclosedCData
            | SyntaxError::UnclosedDoctype
            | SyntaxError::UnclosedPIOrXmlDecl
    ) {
        return true;
    }
    // `<!` followed by too few bytes to tell which construct it starts.
    let tail = tail.trim_ascii_start();
    *err == SyntaxError::InvalidBangMarkup
        && [b"<!--".as_slice(), b"<![CDATA[", b"<!DOCTYPE"]
            .iter()
            .any(|full| tail.len() < full.len() && full.starts_with(tail))
}

fn check_handshake_name(e: &BytesStart<'_>) -> Result<(), FramingError> {
    if e.name().as_ref() != b"k" {
        return Err(FramingError::UnexpectedHandshake(
            String::from_utf8_lossy(e.name().as_ref()).into_owned(),
        ));
    }
    Ok(())
}

/// `<k ok="1" ...>` is complete at its own `>`; the server never closes it
/// until the stream ends.
fn is_accepted_handshake(e: &BytesStart<'_>) -> bool {
    matches!(e.try_get_attribute("ok"), Ok(Some(attr)) if attr.value.as_ref() == b"1")
}
