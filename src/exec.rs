//! Run external helpers (`sendmail`, `nc`, device-control commands) with a
//! hard deadline so no caller blocks indefinitely.

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Result of a bounded command run
#[derive(Debug)]
pub struct CommandOutput {
    /// `None` when the process was killed at the deadline
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn timed_out(&self) -> bool {
        self.status.is_none()
    }
}

/// Spawn `cmd`, optionally feed `stdin`, and wait at most `timeout`
pub fn run_with_timeout(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> io::Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    // 写入也计入超时：子进程不读 stdin 时不能卡住调用方
    let stdin_writer = match (stdin, child.stdin.take()) {
        (Some(input), Some(pipe)) => Some(feed(pipe, input.to_vec())),
        _ => None,
    };

    let stdout_reader = child.stdout.take().map(drain);
    let stderr_reader = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            break None;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let timed_out = status.is_none();
    // 超时后只收集已结束的线程，孙进程可能仍持有管道
    let collect = |reader: Option<thread::JoinHandle<String>>| {
        reader
            .filter(|handle| !timed_out || handle.is_finished())
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    };
    // 未写完的写线程不等待，子进程或孙进程关闭管道后自行退出
    if let Some(writer) = stdin_writer.filter(|w| w.is_finished()) {
        let _ = writer.join();
    }

    Ok(CommandOutput {
        status,
        stdout: collect(stdout_reader),
        stderr: collect(stderr_reader),
    })
}

/// Write `input` on its own thread; the pipe closes on drop so the child sees EOF
fn feed<W: Write + Send + 'static>(mut pipe: W, input: Vec<u8>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = pipe.write_all(&input) {
            warn!(error = %e, "Failed to write command stdin");
        }
    })
}

/// Read a pipe to the end on its own thread so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_success_and_stdin() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "read line; [ \"$line\" = hello ]"]),
            Some(b"hello\n"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(out.success());
        assert!(!out.timed_out());
    }

    #[test]
    fn test_captures_stdout() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo 10.0.0.1 dev eth0"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "10.0.0.1 dev eth0");
    }

    #[test]
    fn test_failure_captures_stderr() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo boom >&2; exit 3"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[test]
    fn test_timeout_kills_process() {
        let started = Instant::now();
        let out = run_with_timeout(
            Command::new("sleep").arg("5"),
            None,
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(out.timed_out());
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_timeout_when_child_ignores_stdin() {
        let input = vec![b'x'; 1024 * 1024];
        let started = Instant::now();
        let out = run_with_timeout(
            Command::new("sleep").arg("4"),
            Some(&input),
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(out.timed_out());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_missing_binary_is_error() {
        let result = run_with_timeout(
            &mut Command::new("/nonexistent/binary"),
            None,
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }
}
