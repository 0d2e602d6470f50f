//! Background read loop: pulls bytes off the pipe, reassembles frames and
//! hands decoded events to the channel's dispatcher.

use aether_proto::{Event, FrameDecoder, ProtocolError};
use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const TOKEN_PIPE: Token = Token(0);
const TOKEN_WAKE: Token = Token(1);

/// How the loop ended.
#[derive(Debug)]
pub(crate) enum ReadExit {
    Cancelled,
    PeerClosed,
    Io(io::Error),
    Protocol(ProtocolError),
}

pub(crate) struct Reader {
    poll: Poll,
    stream: UnixStream,
    decoder: FrameDecoder,
    buf: Vec<u8>,
    cancelled: Arc<AtomicBool>,
}

impl Reader {
    /// Take over `stream` for reading. The returned waker interrupts `run`
    /// once `cancelled` has been set.
    pub fn new(
        stream: std::os::unix::net::UnixStream,
        max_frame_len: u32,
        buffer_size: usize,
        cancelled: Arc<AtomicBool>,
    ) -> io::Result<(Self, Waker)> {
        stream.set_nonblocking(true)?;
        let mut stream = UnixStream::from_std(stream);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, TOKEN_PIPE, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), TOKEN_WAKE)?;

        Ok((
            Self {
                poll,
                stream,
                decoder: FrameDecoder::new(max_frame_len),
                buf: vec![0u8; buffer_size],
                cancelled,
            },
            waker,
        ))
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block until the connection ends, calling `dispatch` for each event in
    /// arrival order.
    pub fn run(&mut self, mut dispatch: impl FnMut(Event)) -> ReadExit {
        let mut events = Events::with_capacity(16);
        loop {
            if self.is_cancelled() {
                return ReadExit::Cancelled;
            }
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return ReadExit::Io(e),
            }

            for event in events.iter() {
                if event.token() == TOKEN_PIPE {
                    if let Err(exit) = self.pump(&mut dispatch) {
                        return exit;
                    }
                }
            }
        }
    }

    /// Read until the socket would block. Frames are dispatched after every
    /// read so the decoder never holds more than one oversized header's worth
    /// of unchecked data.
    fn pump(&mut self, dispatch: &mut impl FnMut(Event)) -> Result<(), ReadExit> {
        loop {
            if self.is_cancelled() {
                return Err(ReadExit::Cancelled);
            }
            match self.stream.read(&mut self.buf) {
                Ok(0) => {
                    return Err(match self.decoder.finish() {
                        Ok(()) => ReadExit::PeerClosed,
                        Err(e) => ReadExit::Protocol(e),
                    });
                }
                Ok(n) => {
                    self.decoder.extend(&self.buf[..n]);
                    self.dispatch_frames(dispatch)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ReadExit::Io(e)),
            }
        }
    }

    fn dispatch_frames(&mut self, dispatch: &mut impl FnMut(Event)) -> Result<(), ReadExit> {
        while let Some(frame) = self.decoder.next_frame().map_err(ReadExit::Protocol)? {
            if self.is_cancelled() {
                return Err(ReadExit::Cancelled);
            }
            let event = Event::decode(&frame).map_err(ReadExit::Protocol)?;
            log::debug!("Received frame 0x{:02x} ({} bytes)", frame.opcode, frame.payload.len());
            dispatch(event);
        }
        Ok(())
    }
}
