// External commands with a deadline

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How often a running command is checked for exit
const POLL_EVERY: Duration = Duration::from_millis(10);

/// Run `program` to completion, killing it once `timeout` has passed.
///
/// Both pipes are drained on their own threads so a child with a lot of
/// output never stalls on a full pipe.
pub(crate) fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute {} command", program))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait for {}", program))?
        {
            break status;
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("{} did not exit within {:?}, killed it", program, timeout);
        }
        thread::sleep(POLL_EVERY);
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_collects_output() {
        let output = run_command("echo", &["hello"], Duration::from_secs(10)).unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn test_run_command_kills_a_hung_child() {
        let started = Instant::now();
        let result = run_command("sleep", &["30"], Duration::from_millis(100));

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
