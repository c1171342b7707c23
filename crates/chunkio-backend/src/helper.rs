//! Helper-program chunk store
//!
//! [`HelperStore`] implements [`RemoteChunkStore`] by spawning an
//! external helper program once per operation and talking to it over
//! stdin/stdout. The sub-command surface maps one-to-one to the store
//! operations:
//!
//! ```text
//! <prog> options                        supported option keys, one per line
//! <prog> testconnection                 exit 0 = reachable
//! <prog> stat <volume> <chunk>          prints "<size>\n"
//! <prog> list <volume>                  prints lines "<name> <size>\n"
//! <prog> upload <volume> <chunk>        reads bytes from stdin
//! <prog> download <volume> <chunk>      writes bytes to stdout
//! <prog> remove <volume> <chunk>        exit 0
//! ```
//!
//! Accepted options are exported to every helper invocation as
//! environment variables. A per-call watchdog kills the helper when no
//! I/O progress happens within the program timeout; every successfully
//! transferred slice resets it.

use crate::{ChunkStat, RemoteChunkStore};
use chunkio_common::{Error, Result, chunk_name};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Watchdog timeout applied when `program_timeout` is not configured.
pub const DEFAULT_PROGRAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload/download slice size; the watchdog is reset after each slice.
const MAX_IO_SLICE: usize = 256 * 1024;

/// How often the watchdog re-examines progress.
const WATCHDOG_POLL: Duration = Duration::from_millis(100);

/// Chunk store backed by an external helper program.
#[derive(Debug)]
pub struct HelperStore {
    program: PathBuf,
    program_timeout: Duration,
    env_vars: BTreeMap<String, String>,
}

impl HelperStore {
    /// Create a store for the given helper program.
    ///
    /// A relative path is resolved against `scripts_dir`. The resolved
    /// path must exist.
    pub fn new(program: impl AsRef<Path>, scripts_dir: Option<&Path>) -> Result<Self> {
        let program = program.as_ref();
        let program = match scripts_dir {
            Some(dir) if program.is_relative() => dir.join(program),
            _ => program.to_path_buf(),
        };

        if !program.exists() {
            return Err(Error::config(format!(
                "program path '{}' does not exist",
                program.display()
            )));
        }
        debug!(program = %program.display(), "using helper program");

        Ok(Self {
            program,
            program_timeout: DEFAULT_PROGRAM_TIMEOUT,
            env_vars: BTreeMap::new(),
        })
    }

    /// Override the per-invocation watchdog timeout. Zero keeps the
    /// default.
    pub fn set_program_timeout(&mut self, seconds: u64) {
        if seconds > 0 {
            self.program_timeout = Duration::from_secs(seconds);
        }
    }

    /// Ask the helper which option names it accepts, one token per
    /// line of `options` output.
    pub fn supported_options(&self) -> Result<Vec<String>> {
        let output = self.run_capture(&["options"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Set one helper option, exported as an environment variable to
    /// every subsequent invocation.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        if !is_valid_env_name(name) {
            return Err(Error::config(format!(
                "option name '{name}' is not usable as an environment variable"
            )));
        }
        trace!(name, value, "helper option set");
        self.env_vars.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn spawn(&self, args: &[&str], want_stdin: bool) -> Result<HelperProc> {
        HelperProc::spawn(
            &self.program,
            args,
            &self.env_vars,
            self.program_timeout,
            want_stdin,
        )
    }

    /// Run a sub-command and capture its whole stdout.
    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let mut proc = self.spawn(args, false)?;
        let output = proc.read_to_end()?;
        proc.finish()?;
        String::from_utf8(output)
            .map_err(|_| Error::protocol(format!("non-text output from helper {}", args[0])))
    }
}

impl RemoteChunkStore for HelperStore {
    fn check_connection(&self) -> Result<()> {
        trace!("testconnection called");
        self.run_capture(&["testconnection"]).map(drop)
    }

    fn stat_chunk(&self, volume: &str, chunk: u16) -> Result<ChunkStat> {
        let name = chunk_name(chunk);
        trace!(volume, chunk = %name, "stat called");

        // Any stat failure reads as absence: the helper has no richer
        // way to report a missing blob than a non-zero exit.
        let output = match self.run_capture(&["stat", volume, &name]) {
            Ok(output) => output,
            Err(Error::Protocol(msg)) => return Err(Error::Protocol(msg)),
            Err(_) => return Err(Error::not_found(volume, name)),
        };
        let size = output
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("unparseable stat output '{}'", output.trim())))?;
        Ok(ChunkStat { size })
    }

    fn list_chunks(&self, volume: &str) -> Result<BTreeMap<String, u64>> {
        trace!(volume, "list called");
        let output = self.run_capture(&["list", volume])?;

        let mut result = BTreeMap::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(name), Some(size), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::protocol(format!("unparseable list line '{line}'")));
            };
            let size = size
                .parse()
                .map_err(|_| Error::protocol(format!("unparseable list line '{line}'")))?;
            result.insert(name.to_string(), size);
        }
        Ok(result)
    }

    fn put_chunk(&self, volume: &str, chunk: u16, data: &[u8]) -> Result<()> {
        let name = chunk_name(chunk);
        debug!(volume, chunk = %name, len = data.len(), "uploading chunk");

        let mut proc = self.spawn(&["upload", volume, &name], true)?;
        proc.write_all_sliced(data)?;
        proc.close_stdin();
        // Drain anything the helper prints before it exits.
        proc.read_to_end()?;
        proc.finish()
    }

    fn get_chunk(&self, volume: &str, chunk: u16, dest: &mut [u8]) -> Result<usize> {
        let name = chunk_name(chunk);
        debug!(volume, chunk = %name, len = dest.len(), "downloading chunk");

        let stat = self.stat_chunk(volume, chunk)?;
        if stat.size != dest.len() as u64 {
            return Err(Error::SizeMismatch {
                expected: stat.size,
                actual: dest.len() as u64,
            });
        }

        let mut proc = self.spawn(&["download", volume, &name], false)?;
        proc.read_exact_sliced(dest)?;
        proc.expect_eof()?;
        proc.finish()?;
        Ok(dest.len())
    }

    fn remove_chunk(&self, volume: &str, chunk_name: &str) -> Result<()> {
        trace!(volume, chunk = chunk_name, "remove called");
        self.run_capture(&["remove", volume, chunk_name]).map(drop)
    }
}

// According to POSIX the environment namespace is letters, digits and
// underscore, not starting with a digit.
fn is_valid_env_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == b'_')
        && bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Progress state shared between the caller and the watchdog thread.
struct WatchdogState {
    last_activity: Mutex<Instant>,
    expired: AtomicBool,
    stop: AtomicBool,
}

impl WatchdogState {
    /// Mark forward progress, pushing the watchdog deadline out.
    fn keepalive(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// One running helper invocation with its watchdog.
struct HelperProc {
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    state: Arc<WatchdogState>,
    watchdog: Option<thread::JoinHandle<()>>,
    timeout: Duration,
    context: String,
}

impl HelperProc {
    fn spawn(
        program: &Path,
        args: &[&str],
        env_vars: &BTreeMap<String, String>,
        timeout: Duration,
        want_stdin: bool,
    ) -> Result<Self> {
        let context = format!("{} {}", program.display(), args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .envs(env_vars)
            .stdin(if want_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::transient(format!("failed to spawn '{context}': {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let child = Arc::new(Mutex::new(child));
        let state = Arc::new(WatchdogState {
            last_activity: Mutex::new(Instant::now()),
            expired: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        let watchdog = {
            let child = Arc::clone(&child);
            let state = Arc::clone(&state);
            thread::spawn(move || watchdog_loop(&child, &state, timeout))
        };

        Ok(Self {
            child,
            stdin,
            stdout,
            state,
            watchdog: Some(watchdog),
            timeout,
            context,
        })
    }

    /// Feed the helper's stdin in bounded slices. A broken pipe means
    /// the helper rejected the payload and is permanent; interrupted
    /// writes are retried.
    fn write_all_sliced(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::permanent(format!(
                "helper '{}' has no stdin pipe",
                self.context
            )));
        };

        let mut written = 0;
        while written < data.len() {
            let end = (written + MAX_IO_SLICE).min(data.len());
            match stdin.write(&data[written..end]) {
                Ok(0) => {
                    return Err(Error::permanent(format!(
                        "helper '{}' stopped accepting input after {written} of {} bytes",
                        self.context,
                        data.len()
                    )));
                }
                Ok(n) => {
                    written += n;
                    self.state.keepalive();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    return Err(Error::permanent(format!(
                        "broken pipe after writing {written} of {} bytes into '{}'",
                        data.len(),
                        self.context
                    )));
                }
                Err(e) => {
                    return Err(Error::transient(format!(
                        "write error after {written} of {} bytes into '{}': {e}",
                        data.len(),
                        self.context
                    )));
                }
            }
        }
        Ok(())
    }

    /// Close the write side so the helper sees EOF on its stdin.
    fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Read exactly `dest.len()` bytes; premature EOF is a protocol
    /// error.
    fn read_exact_sliced(&mut self, dest: &mut [u8]) -> Result<()> {
        let total = dest.len();
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(Error::permanent(format!(
                "helper '{}' has no stdout pipe",
                self.context
            )));
        };

        let mut read = 0;
        while read < total {
            let end = (read + MAX_IO_SLICE).min(total);
            match stdout.read(&mut dest[read..end]) {
                Ok(0) => {
                    return Err(Error::protocol(format!(
                        "unexpected EOF after reading {read} of {total} bytes from '{}'",
                        self.context
                    )));
                }
                Ok(n) => {
                    read += n;
                    self.state.keepalive();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::transient(format!(
                        "read error after {read} of {total} bytes from '{}': {e}",
                        self.context
                    )));
                }
            }
        }
        Ok(())
    }

    /// The helper must not produce bytes past the declared size.
    fn expect_eof(&mut self) -> Result<()> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(());
        };
        let mut probe = [0u8; 1];
        loop {
            match stdout.read(&mut probe) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    return Err(Error::protocol(format!(
                        "additional data after expected end of stream from '{}'",
                        self.context
                    )));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::transient(format!(
                        "read error from '{}': {e}",
                        self.context
                    )));
                }
            }
        }
    }

    /// Read stdout until EOF.
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(Vec::new());
        };
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => return Ok(output),
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    self.state.keepalive();
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::transient(format!(
                        "read error from '{}': {e}",
                        self.context
                    )));
                }
            }
        }
    }

    /// Reap the helper and translate its exit status.
    fn finish(mut self) -> Result<()> {
        self.stdin.take();
        self.stdout.take();

        // The watchdog bounds this wait: it kills the child once the
        // timeout elapses without progress, so poll rather than block
        // while holding the child lock.
        let status = loop {
            let polled = self.child.lock().try_wait();
            match polled {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(Duration::from_millis(10)),
                Err(e) => {
                    self.stop_watchdog();
                    return Err(Error::transient(format!(
                        "failed to reap helper '{}': {e}",
                        self.context
                    )));
                }
            }
        };
        self.stop_watchdog();

        if self.state.expired.load(Ordering::Acquire) {
            return Err(Error::transient(format!(
                "helper '{}' made no progress for {:?} and was killed",
                self.context, self.timeout
            )));
        }
        exit_status_to_result(status, &self.context)
    }

    fn stop_watchdog(&mut self) {
        self.state.stop.store(true, Ordering::Release);
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HelperProc {
    fn drop(&mut self) {
        // Error paths land here with the child possibly still running.
        self.stdin.take();
        self.stdout.take();
        {
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stop_watchdog();
    }
}

fn exit_status_to_result(status: ExitStatus, context: &str) -> Result<()> {
    if status.success() {
        trace!(context, "helper succeeded");
        return Ok(());
    }
    if let Some(signal) = status.signal() {
        return Err(Error::permanent(format!(
            "helper '{context}' was killed by signal {signal}"
        )));
    }
    Err(Error::permanent(format!(
        "helper '{context}' exited with status {}",
        status.code().unwrap_or(-1)
    )))
}

fn watchdog_loop(child: &Mutex<Child>, state: &WatchdogState, timeout: Duration) {
    loop {
        if state.stop.load(Ordering::Acquire) {
            return;
        }
        let elapsed = state.last_activity.lock().elapsed();
        if elapsed >= timeout {
            state.expired.store(true, Ordering::Release);
            let _ = child.lock().kill();
            return;
        }
        thread::sleep((timeout - elapsed).min(WATCHDOG_POLL));
    }
}
