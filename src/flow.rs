//! per direction relay state machine
//!
//! a [Flow] drives one direction of a session (client to upstream, or
//! upstream to client) through `StartLine -> Headers -> Body` and back, or
//! into the terminal `Passthrough` once a protocol upgrade succeeded. It
//! never touches a socket: the pipeline feeds it chunks and acts on the
//! returned events, which keeps every state reachable from plain unit tests.
//!
//! `process` consumes at most one event's worth of a chunk; unconsumed bytes
//! are reported back so the caller can push them onto the stream for the
//! next round.

use memchr::memchr;

use crate::{answers::AnswerKind, fault::RelayFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// client to upstream: requests
    Inbound,
    /// upstream to client: responses
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    StartLine,
    Headers,
    Body { remaining: u64 },
    Passthrough,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FlowEvent {
    /// nothing completed, feed more chunks
    NeedMore,
    /// a complete header block: all lines with their CRLF, terminator
    /// excluded
    Headers(Vec<Vec<u8>>),
    /// `len` body bytes to relay verbatim; `complete` marks the end of the
    /// current request/response unit
    Data { len: usize, complete: bool },
}

pub struct Flow {
    direction: FlowDirection,
    state: FlowState,
    lines: Vec<Vec<u8>>,
    partial: Vec<u8>,
    /// original bytes of the head being accumulated, for hand-over pushback
    raw: Vec<u8>,
    block_size: usize,
    max_line: usize,
    max_block: usize,
}

impl Flow {
    pub fn new(direction: FlowDirection, max_line: usize) -> Flow {
        Flow {
            direction,
            state: FlowState::StartLine,
            lines: Vec::new(),
            partial: Vec::new(),
            raw: Vec::new(),
            block_size: 0,
            max_line,
            max_block: max_line * 10,
        }
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn is_passthrough(&self) -> bool {
        self.state == FlowState::Passthrough
    }

    /// switches to verbatim relay; used after a successful upgrade and for
    /// close delimited response bodies
    pub fn set_passthrough(&mut self) {
        self.state = FlowState::Passthrough;
        self.lines.clear();
        self.partial.clear();
        self.raw.clear();
        self.block_size = 0;
    }

    /// arms the body relay after the head was processed; a zero length body
    /// loops straight back to the next start line
    pub fn begin_body(&mut self, length: u64) {
        self.raw.clear();
        self.block_size = 0;
        self.state = if length > 0 {
            FlowState::Body { remaining: length }
        } else {
            FlowState::StartLine
        };
    }

    /// original bytes of the in-progress head, for re-driving a hand-over
    pub fn take_raw(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.raw)
    }

    /// puts body bytes back on the meter after the caller could not forward
    /// everything a `Data` event reported
    pub fn rewind_body(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.state = match &self.state {
            FlowState::Body { remaining } => FlowState::Body {
                remaining: remaining + count,
            },
            // the event said complete but some of it went back
            FlowState::StartLine => FlowState::Body { remaining: count },
            other => other.clone(),
        };
    }

    fn oversized(&self) -> RelayFault {
        match self.direction {
            FlowDirection::Inbound => RelayFault::Status(AnswerKind::Answer413),
            FlowDirection::Outbound => RelayFault::internal("oversized upstream response head"),
        }
    }

    fn malformed(&self, message: &str) -> RelayFault {
        match self.direction {
            FlowDirection::Inbound => RelayFault::Status(AnswerKind::Answer400),
            FlowDirection::Outbound => RelayFault::internal(message.to_string()),
        }
    }

    /// feeds one chunk; returns the first event it completes and how many of
    /// the chunk's bytes it consumed (the caller pushes the rest back)
    pub fn process(&mut self, chunk: &[u8]) -> Result<(FlowEvent, usize), RelayFault> {
        match self.state {
            FlowState::StartLine | FlowState::Headers => self.process_lines(chunk),
            FlowState::Body { remaining } => {
                let take = std::cmp::min(remaining, chunk.len() as u64) as usize;
                let complete = take as u64 == remaining;
                if complete {
                    self.state = FlowState::StartLine;
                } else {
                    self.state = FlowState::Body {
                        remaining: remaining - take as u64,
                    };
                }
                Ok((
                    FlowEvent::Data {
                        len: take,
                        complete,
                    },
                    take,
                ))
            }
            FlowState::Passthrough => Ok((
                FlowEvent::Data {
                    len: chunk.len(),
                    complete: false,
                },
                chunk.len(),
            )),
        }
    }

    fn process_lines(&mut self, chunk: &[u8]) -> Result<(FlowEvent, usize), RelayFault> {
        let mut consumed = 0usize;

        while consumed < chunk.len() {
            let rest = &chunk[consumed..];
            match memchr(b'\n', rest) {
                None => {
                    self.partial.extend_from_slice(rest);
                    self.raw.extend_from_slice(rest);
                    consumed = chunk.len();
                    self.check_ceilings(self.partial.len())?;
                    break;
                }
                Some(pos) => {
                    let mut line = std::mem::take(&mut self.partial);
                    line.extend_from_slice(&rest[..=pos]);
                    self.raw.extend_from_slice(&rest[..=pos]);
                    consumed += pos + 1;

                    // a lone LF is not a line terminator here
                    if line.len() < 2 || line[line.len() - 2] != b'\r' {
                        return Err(self.malformed("bare LF in header section"));
                    }

                    if line == b"\r\n" {
                        if self.lines.is_empty() {
                            // tolerate empty lines in front of the start line
                            continue;
                        }
                        let lines = std::mem::take(&mut self.lines);
                        return Ok((FlowEvent::Headers(lines), consumed));
                    }

                    self.check_ceilings(line.len())?;
                    self.block_size += line.len();
                    self.lines.push(line);
                    self.state = FlowState::Headers;
                }
            }
        }

        Ok((FlowEvent::NeedMore, consumed))
    }

    /// `line_len` is the completed line or the partial accumulated so far;
    /// it only counts into the block once the line completes
    fn check_ceilings(&self, line_len: usize) -> Result<(), RelayFault> {
        if line_len > self.max_line {
            return Err(self.oversized());
        }
        if self.block_size + line_len > self.max_block {
            return Err(self.oversized());
        }
        Ok(())
    }
}
