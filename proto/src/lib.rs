//! Wire protocol for the AetherVisor frontend <-> backend pipe.
//!
//! All messages are framed as: [length: u32 LE] [opcode: u8] [payload]
//! where `length` counts the opcode byte plus the payload, so it is never 0.

use thiserror::Error;

/// Client → Backend opcodes
pub mod client {
    /// Attach the backend to a target process
    /// Payload: process name, UTF-16LE
    pub const INJECT: u8 = 0x01;

    /// Run a script
    /// Payload: script source, UTF-8
    pub const EXECUTE_SCRIPT: u8 = 0x02;

    /// Set the backend's tunable sensitivity value
    /// Payload: [value: f64 LE]
    pub const CONFIGURE: u8 = 0x03;

    /// Ask for a safety verdict before execution
    /// Payload: script source, UTF-8
    pub const ANALYZE_SCRIPT: u8 = 0x04;

    /// Ask the backend to shut down (no payload)
    pub const SHUTDOWN: u8 = 0x05;
}

/// Backend → Client opcodes
pub mod server {
    /// One line of console output
    /// Payload: UTF-8 text
    pub const CONSOLE_OUTPUT: u8 = 0x81;

    /// Connection / injection status
    /// Payload: UTF-8 text
    pub const STATUS_UPDATE: u8 = 0x82;

    /// Result of an AnalyzeScript request
    /// Payload: UTF-8 "SAFE" or "UNSAFE"
    pub const ANALYSIS_RESULT: u8 = 0x83;
}

/// Size of the length prefix.
pub const LENGTH_SIZE: usize = 4;

/// Largest `length` value either side will accept: 1 MiB.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

const CONFIGURE_PAYLOAD_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame declares zero length")]
    EmptyFrame,

    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: u32 },

    #[error("stream ended mid-frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("payload of opcode 0x{opcode:02x} is not valid UTF-8")]
    InvalidUtf8 { opcode: u8 },

    #[error("payload of opcode 0x{opcode:02x} is not valid UTF-16LE")]
    InvalidUtf16 { opcode: u8 },

    #[error("analysis result must be SAFE or UNSAFE, got {0:?}")]
    InvalidAnalysisResult(String),

    #[error("payload of opcode 0x{opcode:02x} must be {expected} bytes, got {actual}")]
    InvalidPayloadLength {
        opcode: u8,
        expected: usize,
        actual: usize,
    },
}

/// One opcode-tagged unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: u8, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Value of the length prefix for this frame.
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Encode into `[length][opcode][payload]`, refusing frames over `max_len`.
    pub fn encode(&self, max_len: u32) -> Result<Vec<u8>, ProtocolError> {
        let len = self.wire_len();
        if len > max_len as usize {
            return Err(ProtocolError::FrameTooLarge { len, max: max_len });
        }
        let mut buf = Vec::with_capacity(LENGTH_SIZE + len);
        buf.extend_from_slice(&(len as u32).to_le_bytes());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Parse a length prefix.
pub fn decode_length(header: &[u8; LENGTH_SIZE]) -> u32 {
    u32::from_le_bytes(*header)
}

/// Incremental frame reassembly over a byte stream.
///
/// Bytes are pushed as they arrive from the socket; complete frames are popped
/// in order. The declared length is validated before any payload is buffered
/// for it, so a hostile header never causes a large allocation.
pub struct FrameDecoder {
    buf: Vec<u8>,
    offset: usize,
    max_len: u32,
}

impl FrameDecoder {
    pub fn new(max_len: u32) -> Self {
        Self {
            buf: Vec::new(),
            offset: 0,
            max_len: max_len.min(MAX_FRAME_LEN),
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        if self.offset > 0 {
            self.buf.drain(..self.offset);
            self.offset = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Pop the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let pending = &self.buf[self.offset..];
        if pending.len() < LENGTH_SIZE {
            return Ok(None);
        }
        let header: [u8; LENGTH_SIZE] = [pending[0], pending[1], pending[2], pending[3]];
        let len = decode_length(&header) as usize;
        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > self.max_len as usize {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        if pending.len() < LENGTH_SIZE + len {
            return Ok(None); // incomplete frame
        }

        let opcode = pending[LENGTH_SIZE];
        let payload = pending[LENGTH_SIZE + 1..LENGTH_SIZE + len].to_vec();
        self.offset += LENGTH_SIZE + len;
        Ok(Some(Frame { opcode, payload }))
    }

    /// Called at end of stream: leftover bytes mean the peer stopped mid-frame.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        let available = self.buffered();
        if available == 0 {
            return Ok(());
        }
        let pending = &self.buf[self.offset..];
        let needed = if available < LENGTH_SIZE {
            LENGTH_SIZE
        } else {
            let header: [u8; LENGTH_SIZE] = [pending[0], pending[1], pending[2], pending[3]];
            LENGTH_SIZE + decode_length(&header) as usize
        };
        Err(ProtocolError::Truncated { needed, available })
    }
}

/// Messages the frontend sends to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Inject(String),
    ExecuteScript(String),
    Configure(f64),
    AnalyzeScript(String),
    Shutdown,
}

impl Request {
    pub fn opcode(&self) -> u8 {
        match self {
            Request::Inject(_) => client::INJECT,
            Request::ExecuteScript(_) => client::EXECUTE_SCRIPT,
            Request::Configure(_) => client::CONFIGURE,
            Request::AnalyzeScript(_) => client::ANALYZE_SCRIPT,
            Request::Shutdown => client::SHUTDOWN,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Request::Inject(name) => encode_utf16le(name),
            Request::ExecuteScript(script) | Request::AnalyzeScript(script) => {
                script.as_bytes().to_vec()
            }
            Request::Configure(value) => value.to_le_bytes().to_vec(),
            Request::Shutdown => Vec::new(),
        };
        Frame::new(self.opcode(), payload)
    }

    /// Decode a frame received by the backend side.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let opcode = frame.opcode;
        match opcode {
            client::INJECT => decode_utf16le(opcode, &frame.payload).map(Request::Inject),
            client::EXECUTE_SCRIPT => decode_utf8(opcode, &frame.payload).map(Request::ExecuteScript),
            client::CONFIGURE => {
                let bytes: [u8; CONFIGURE_PAYLOAD_LEN] =
                    frame.payload.as_slice().try_into().map_err(|_| {
                        ProtocolError::InvalidPayloadLength {
                            opcode,
                            expected: CONFIGURE_PAYLOAD_LEN,
                            actual: frame.payload.len(),
                        }
                    })?;
                Ok(Request::Configure(f64::from_le_bytes(bytes)))
            }
            client::ANALYZE_SCRIPT => decode_utf8(opcode, &frame.payload).map(Request::AnalyzeScript),
            client::SHUTDOWN => {
                if !frame.payload.is_empty() {
                    return Err(ProtocolError::InvalidPayloadLength {
                        opcode,
                        expected: 0,
                        actual: frame.payload.len(),
                    });
                }
                Ok(Request::Shutdown)
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Verdict carried by an analysis result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisResult {
    Safe,
    Unsafe,
}

impl AnalysisResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisResult::Safe => "SAFE",
            AnalysisResult::Unsafe => "UNSAFE",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        match text {
            "SAFE" => Ok(AnalysisResult::Safe),
            "UNSAFE" => Ok(AnalysisResult::Unsafe),
            other => Err(ProtocolError::InvalidAnalysisResult(other.to_string())),
        }
    }
}

/// Messages the backend sends to the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConsoleOutput(String),
    StatusUpdate(String),
    AnalysisResult(AnalysisResult),
}

impl Event {
    pub fn opcode(&self) -> u8 {
        match self {
            Event::ConsoleOutput(_) => server::CONSOLE_OUTPUT,
            Event::StatusUpdate(_) => server::STATUS_UPDATE,
            Event::AnalysisResult(_) => server::ANALYSIS_RESULT,
        }
    }

    pub fn to_frame(&self) -> Frame {
        let payload = match self {
            Event::ConsoleOutput(text) | Event::StatusUpdate(text) => text.as_bytes().to_vec(),
            Event::AnalysisResult(result) => result.as_str().as_bytes().to_vec(),
        };
        Frame::new(self.opcode(), payload)
    }

    /// Decode a frame received by the frontend side.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let opcode = frame.opcode;
        match opcode {
            server::CONSOLE_OUTPUT => decode_utf8(opcode, &frame.payload).map(Event::ConsoleOutput),
            server::STATUS_UPDATE => decode_utf8(opcode, &frame.payload).map(Event::StatusUpdate),
            server::ANALYSIS_RESULT => {
                let text = decode_utf8(opcode, &frame.payload)?;
                AnalysisResult::parse(&text).map(Event::AnalysisResult)
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

/// Encode a string as UTF-16LE code units, no terminator.
pub fn encode_utf16le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn decode_utf16le(opcode: u8, payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::InvalidUtf16 { opcode });
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16 { opcode })
}

fn decode_utf8(opcode: u8, payload: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { opcode })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_script_frame_layout() {
        let frame = Request::ExecuteScript("print('test')".to_string()).to_frame();
        let encoded = frame.encode(MAX_FRAME_LEN).unwrap();
        assert_eq!(encoded.len(), LENGTH_SIZE + 15);

        let header: [u8; LENGTH_SIZE] = encoded[..LENGTH_SIZE].try_into().unwrap();
        assert_eq!(decode_length(&header), 15);
        assert_eq!(encoded[4], client::EXECUTE_SCRIPT);
        assert_eq!(&encoded[5..], b"print('test')");
    }

    #[test]
    fn inject_payload_is_utf16le() {
        let frame = Request::Inject("Game.exe".to_string()).to_frame();
        assert_eq!(frame.opcode, client::INJECT);
        assert_eq!(frame.payload.len(), 16);
        assert_eq!(&frame.payload[..4], &[b'G', 0, b'a', 0]);
        assert_eq!(
            Request::decode(&frame).unwrap(),
            Request::Inject("Game.exe".to_string())
        );
    }

    #[test]
    fn configure_payload_is_eight_byte_double() {
        let frame = Request::Configure(0.75).to_frame();
        assert_eq!(frame.payload, 0.75f64.to_le_bytes().to_vec());
        assert_eq!(Request::decode(&frame).unwrap(), Request::Configure(0.75));

        let short = Frame::new(client::CONFIGURE, vec![0; 4]);
        assert_eq!(
            Request::decode(&short),
            Err(ProtocolError::InvalidPayloadLength {
                opcode: client::CONFIGURE,
                expected: 8,
                actual: 4
            })
        );
    }

    #[test]
    fn shutdown_is_opcode_only() {
        let encoded = Request::Shutdown.to_frame().encode(MAX_FRAME_LEN).unwrap();
        assert_eq!(encoded, vec![1, 0, 0, 0, client::SHUTDOWN]);
    }

    #[test]
    fn decoder_reassembles_byte_by_byte() {
        let mut wire = Event::StatusUpdate("Injected".to_string())
            .to_frame()
            .encode(MAX_FRAME_LEN)
            .unwrap();
        wire.extend(
            Event::ConsoleOutput("hello".to_string())
                .to_frame()
                .encode(MAX_FRAME_LEN)
                .unwrap(),
        );

        let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
        let mut frames = Vec::new();
        for byte in &wire {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(Event::decode(&frame).unwrap());
            }
        }
        assert_eq!(
            frames,
            vec![
                Event::StatusUpdate("Injected".to_string()),
                Event::ConsoleOutput("hello".to_string()),
            ]
        );
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn decoder_rejects_oversized_from_header_alone() {
        let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
        decoder.extend(&(MAX_FRAME_LEN + 1).to_le_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge {
                len: MAX_FRAME_LEN as usize + 1,
                max: MAX_FRAME_LEN
            })
        );
    }

    #[test]
    fn decoder_honours_smaller_limit() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(&9u32.to_le_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { len: 9, max: 8 })
        ));
    }

    #[test]
    fn decoder_rejects_zero_length() {
        let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
        decoder.extend(&[0, 0, 0, 0, 0x81]);
        assert_eq!(decoder.next_frame(), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn finish_reports_short_payload() {
        let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
        // declares 10 bytes, delivers 4
        decoder.extend(&[10, 0, 0, 0, server::CONSOLE_OUTPUT, b'a', b'b', b'c']);
        assert_eq!(decoder.next_frame(), Ok(None));
        assert_eq!(
            decoder.finish(),
            Err(ProtocolError::Truncated {
                needed: 14,
                available: 8
            })
        );
    }

    #[test]
    fn finish_reports_partial_header() {
        let mut decoder = FrameDecoder::new(MAX_FRAME_LEN);
        decoder.extend(&[3, 0]);
        assert_eq!(
            decoder.finish(),
            Err(ProtocolError::Truncated {
                needed: 4,
                available: 2
            })
        );
    }

    #[test]
    fn analysis_result_must_be_exact() {
        let unsafe_frame = Frame::new(server::ANALYSIS_RESULT, b"UNSAFE".to_vec());
        assert_eq!(
            Event::decode(&unsafe_frame).unwrap(),
            Event::AnalysisResult(AnalysisResult::Unsafe)
        );

        let maybe = Frame::new(server::ANALYSIS_RESULT, b"MAYBE".to_vec());
        assert_eq!(
            Event::decode(&maybe),
            Err(ProtocolError::InvalidAnalysisResult("MAYBE".to_string()))
        );
    }

    #[test]
    fn opcode_spaces_do_not_overlap() {
        let request_frame = Request::ExecuteScript("x".to_string()).to_frame();
        assert_eq!(
            Event::decode(&request_frame),
            Err(ProtocolError::UnknownOpcode(client::EXECUTE_SCRIPT))
        );
        let event_frame = Event::StatusUpdate("x".to_string()).to_frame();
        assert_eq!(
            Request::decode(&event_frame),
            Err(ProtocolError::UnknownOpcode(server::STATUS_UPDATE))
        );
    }

    #[test]
    fn invalid_encodings_are_rejected() {
        let odd = Frame::new(client::INJECT, vec![b'a', 0, b'b']);
        assert_eq!(
            Request::decode(&odd),
            Err(ProtocolError::InvalidUtf16 {
                opcode: client::INJECT
            })
        );
        let bad_utf8 = Frame::new(server::CONSOLE_OUTPUT, vec![0xff, 0xfe]);
        assert_eq!(
            Event::decode(&bad_utf8),
            Err(ProtocolError::InvalidUtf8 {
                opcode: server::CONSOLE_OUTPUT
            })
        );
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let frame = Frame::new(client::EXECUTE_SCRIPT, vec![b'x'; 16]);
        assert_eq!(
            frame.encode(16),
            Err(ProtocolError::FrameTooLarge { len: 17, max: 16 })
        );
    }
}
