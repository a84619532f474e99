use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs `command` to completion, or kills it once `timeout` elapses and
/// returns an `io::ErrorKind::TimedOut` error.
///
/// Output goes to anonymous temp files rather than pipes so a chatty child
/// can never stall on a full pipe while it is being polled.
pub(crate) fn output_within(command: &mut Command, timeout: Option<Duration>) -> io::Result<Output> {
    let Some(timeout) = timeout else {
        return command.stdin(Stdio::null()).output();
    };

    let mut stdout = tempfile::tempfile()?;
    let mut stderr = tempfile::tempfile()?;
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout.try_clone()?))
        .stderr(Stdio::from(stderr.try_clone()?))
        .spawn()?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            if let Err(err) = child.kill() {
                warn!(pid = child.id(), error = %err, "failed to kill timed out child");
            }
            child.wait()?;
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {}ms", timeout.as_millis()),
            ));
        }
        thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(started.elapsed())));
    };

    Ok(Output {
        status,
        stdout: read_back(&mut stdout)?,
        stderr: read_back(&mut stderr)?,
    })
}

fn read_back(file: &mut File) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut buffer)?;
    Ok(buffer)
}
