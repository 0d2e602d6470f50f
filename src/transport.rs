//! Pipe plumbing: opening the backend's socket and writing whole frames to it.

use crate::error::ConnectError;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// Interval between attempts while the backend is not accepting yet.
const CONNECT_POLL: Duration = Duration::from_millis(50);

/// Connect to the pipe at `path`, retrying until `timeout` elapses while the
/// pipe is missing or refusing connections. A timeout too large to represent
/// as a deadline waits indefinitely. `abandoned` is polled between attempts.
pub fn connect(
    path: &Path,
    timeout: Duration,
    abandoned: impl Fn() -> bool,
) -> Result<UnixStream, ConnectError> {
    let deadline = Instant::now().checked_add(timeout);
    let mut seen = false;
    loop {
        if abandoned() {
            return Err(ConnectError::Cancelled);
        }
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e) => match e.kind() {
                io::ErrorKind::NotFound => {}
                io::ErrorKind::ConnectionRefused => seen = true,
                io::ErrorKind::PermissionDenied => {
                    return Err(ConnectError::AccessDenied {
                        path: path.to_path_buf(),
                    })
                }
                _ => return Err(ConnectError::Io(e)),
            },
        }

        let now = Instant::now();
        let pause = match deadline {
            Some(deadline) if now >= deadline => {
                return Err(if seen {
                    ConnectError::Timeout {
                        path: path.to_path_buf(),
                        waited: timeout,
                    }
                } else {
                    ConnectError::NotFound {
                        path: path.to_path_buf(),
                    }
                });
            }
            Some(deadline) => CONNECT_POLL.min(deadline - now),
            None => CONNECT_POLL,
        };
        log::debug!("Pipe {:?} not ready, retrying", path);
        std::thread::sleep(pause);
    }
}

/// Write all of `data` to a non-blocking stream, parking in poll(2) whenever
/// the socket buffer is full.
pub fn write_all(mut stream: &UnixStream, data: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "pipe write returned 0",
                ));
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(stream)?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wait_writable(stream: &UnixStream) -> io::Result<()> {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
    match nix::poll::poll(&mut fds, PollTimeout::NONE) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixListener;

    #[test]
    fn missing_pipe_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let started = Instant::now();
        let err = connect(&path, Duration::from_millis(120), || false).unwrap_err();
        assert!(matches!(err, ConnectError::NotFound { .. }));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn stale_socket_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale");
        // Bound then dropped: the file stays but nobody listens.
        drop(UnixListener::bind(&path).unwrap());
        let err = connect(&path, Duration::from_millis(100), || false).unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));
    }

    #[test]
    fn connects_to_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late");
        let bind_path = path.clone();
        let listener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let listener = UnixListener::bind(&bind_path).unwrap();
            listener.accept().unwrap()
        });
        let stream = connect(&path, Duration::from_secs(5), || false).unwrap();
        drop(stream);
        listener.join().unwrap();
    }

    #[test]
    fn unbounded_timeout_still_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live");
        let _listener = UnixListener::bind(&path).unwrap();
        assert!(connect(&path, Duration::MAX, || false).is_ok());
    }

    #[test]
    fn abandoned_attempt_stops_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never");
        let started = Instant::now();
        let err = connect(&path, Duration::MAX, || {
            started.elapsed() >= Duration::from_millis(100)
        })
        .unwrap_err();
        assert!(matches!(err, ConnectError::Cancelled));
    }

    #[test]
    fn write_all_survives_full_buffer() {
        let (client, mut server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        // Larger than any default socket buffer so the writer must park.
        let data = vec![0x5a; 4 * 1024 * 1024];
        let expected = data.len();
        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            server.read_to_end(&mut received).unwrap();
            received.len()
        });
        write_all(&client, &data).unwrap();
        drop(client);
        assert_eq!(reader.join().unwrap(), expected);
    }
}
