//! In-process stand-in for the backend, for channel tests.

use crate::config::ChannelConfig;
use crate::event::ChannelEvent;
use aether_proto::{decode_length, Event, Frame, Request, LENGTH_SIZE, MAX_FRAME_LEN};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::mpsc::Receiver;
use std::time::Duration;
use tempfile::TempDir;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FakeBackend {
    _dir: TempDir,
    listener: UnixListener,
    pub config: ChannelConfig,
}

impl FakeBackend {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ChannelConfig::default()
            .pipe_dir(dir.path())
            .connect_timeout(Duration::from_secs(2));
        let listener = UnixListener::bind(config.pipe_path()).unwrap();
        Self {
            _dir: dir,
            listener,
            config,
        }
    }

    pub fn accept(&self) -> BackendConn {
        let (stream, _) = self.listener.accept().unwrap();
        stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
        BackendConn { stream }
    }
}

pub struct BackendConn {
    stream: UnixStream,
}

impl BackendConn {
    pub fn read_exact_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.stream.read_to_end(&mut buf).unwrap();
        buf
    }

    pub fn read_frame(&mut self) -> Frame {
        let header: [u8; LENGTH_SIZE] = self.read_exact_bytes(LENGTH_SIZE).try_into().unwrap();
        let len = decode_length(&header);
        assert!((1..=MAX_FRAME_LEN).contains(&len), "bad length {}", len);
        let body = self.read_exact_bytes(len as usize);
        Frame::new(body[0], body[1..].to_vec())
    }

    pub fn read_request(&mut self) -> Request {
        Request::decode(&self.read_frame()).unwrap()
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn send_frame(&mut self, frame: &Frame) {
        self.send_raw(&frame.encode(MAX_FRAME_LEN).unwrap());
    }

    pub fn send(&mut self, event: &Event) {
        self.send_frame(&event.to_frame());
    }

    /// Stop reading while keeping the connection open, so client writes fail.
    pub fn shutdown_read(&self) {
        self.stream.shutdown(Shutdown::Read).unwrap();
    }
}

/// Next event, failing the test if none arrives in time.
pub fn recv(rx: &Receiver<ChannelEvent>) -> ChannelEvent {
    rx.recv_timeout(IO_TIMEOUT).expect("no event within timeout")
}

/// Assert nothing else is delivered for a short while.
pub fn assert_quiet(rx: &Receiver<ChannelEvent>) {
    if let Ok(event) = rx.recv_timeout(Duration::from_millis(200)) {
        panic!("unexpected event: {:?}", event);
    }
}
