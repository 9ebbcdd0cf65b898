use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(100);

/// `PHASE:<word>|<digits>` anywhere in a line; percent is capped at 100.
pub fn parse_phase(line: &str) -> Option<(String, u8)> {
    let start = line.find("PHASE:")? + "PHASE:".len();
    let rest = &line[start..];
    let name_len = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    if name_len == 0 {
        return None;
    }
    let (name, rest) = rest.split_at(name_len);
    let digits = rest.strip_prefix('|')?;
    let digits_len = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if digits_len == 0 {
        return None;
    }
    let percent = digits[..digits_len]
        .parse::<u64>()
        .map(|p| p.min(100) as u8)
        .unwrap_or(100);
    Some((name.to_string(), percent))
}

/// Spawns `command` in its own process group with stdout and stderr piped.
/// The returned channel yields lines from both streams and disconnects once
/// both reach EOF.
pub fn spawn_merged(command: &[String]) -> Result<(Child, Receiver<String>)> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("spawn_failed: empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn_failed: {}", program))?;

    let (tx, rx) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }
    Ok((child, rx))
}

fn forward_lines<R: Read + Send + 'static>(stream: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Signals the child's whole process group; falls back to the child alone
/// when the group is already gone.
pub fn signal_group(child: &Child, signal: libc::c_int) -> bool {
    let pid = child.id() as libc::pid_t;
    let ret = unsafe { libc::kill(-pid, signal) };
    if ret == 0 {
        return true;
    }
    unsafe { libc::kill(pid, signal) == 0 }
}

/// SIGTERM, then up to `grace` for a voluntary exit, then SIGKILL.
/// Returns the exit status and whether the kill was needed.
pub fn terminate(child: &mut Child, grace: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, false));
    }
    signal_group(child, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        thread::sleep(POLL);
    }
    warn!(pid = child.id(), grace_secs = grace.as_secs(), "process ignored SIGTERM; killing");
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    Ok((child.wait()?, true))
}

pub fn kill_now(child: &mut Child) -> Result<ExitStatus> {
    signal_group(child, libc::SIGKILL);
    let _ = child.kill();
    Ok(child.wait()?)
}

/// Same escalation for a process this one did not spawn, known only by pid.
/// Liveness is probed with signal 0, so a zombie counts as alive until reaped.
pub fn terminate_pid(pid: u32, grace: Duration) -> bool {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    let alive = || unsafe { libc::kill(pid, 0) == 0 };
    if !alive() {
        return false;
    }
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !alive() {
            return true;
        }
        thread::sleep(POLL);
    }
    warn!(pid, "process ignored SIGTERM; killing");
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
        libc::kill(pid, libc::SIGKILL);
    }
    true
}

/// Whether `pid` still names a process-group leader that started close to
/// `spawned_at`. Pids are recycled, so a recorded pid alone is not enough to
/// signal. Anything unreadable answers false.
pub fn is_spawned_leader(pid: u32, spawned_at: DateTime<Utc>) -> bool {
    let pid_t = match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => pid,
        _ => return false,
    };
    if unsafe { libc::getpgid(pid_t) } != pid_t {
        return false;
    }
    let Some(started) = process_start(pid) else {
        return false;
    };
    let delta = started.signed_duration_since(spawned_at);
    delta >= -ChronoDuration::seconds(2) && delta <= ChronoDuration::seconds(30)
}

/// Start time from `/proc/<pid>/stat` (field 22, clock ticks since boot).
fn process_start(pid: u32) -> Option<DateTime<Utc>> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm can hold spaces and parens; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let start_ticks: i64 = rest.split_whitespace().nth(19)?.parse().ok()?;
    let boot_secs: i64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime ")?.trim().parse().ok())?;
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    let millis = boot_secs * 1000 + start_ticks * 1000 / ticks_per_sec as i64;
    Utc.timestamp_millis_opt(millis).single()
}

/// Runs a helper command to completion, killing it after `timeout`.
pub fn run_with_timeout(command: &[String], timeout: Duration) -> Result<ExitStatus> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("spawn_failed: empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn_failed: {}", program))?;
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            debug!(program = %program, code = ?status.code(), "helper finished");
            return Ok(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow!(
                "helper_timeout: {} did not finish within {}s",
                program,
                timeout.as_secs()
            ));
        }
        thread::sleep(POLL);
    }
}

pub fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("Process exited with code {}", code),
        None => {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(sig) => format!("Process terminated by signal {}", sig),
                None => "Process exited abnormally".to_string(),
            }
        }
    }
}
