//! Hand-off between the capture session and the CPU state extractor.
//!
//! The session posts a request file carrying a token once memory is pinned.
//! The extractor writes the register file and then a completion marker
//! echoing that token. The session accepts a matching marker, or falls back
//! to a register file written after the request whose size is stable across
//! one poll.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use qsnap_config::WaitConfig;

use crate::{CaptureError, CaptureResult};

pub const REGS_FILE: &str = "regs.json";
const REQUEST_FILE: &str = "regs.json.request";
const DONE_FILE: &str = "regs.json.done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self::from(&WaitConfig::default())
    }
}

impl From<&WaitConfig> for WaitOptions {
    fn from(cfg: &WaitConfig) -> Self {
        Self {
            timeout: (cfg.timeout_secs > 0).then(|| Duration::from_secs(cfg.timeout_secs)),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionSignal {
    regs: PathBuf,
    request: PathBuf,
    done: PathBuf,
}

impl CompletionSignal {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            regs: dir.join(REGS_FILE),
            request: dir.join(REQUEST_FILE),
            done: dir.join(DONE_FILE),
        }
    }

    pub fn regs_path(&self) -> &Path {
        &self.regs
    }

    /// Remove leftovers of an earlier session.
    pub fn clear(&self) -> CaptureResult<()> {
        for path in [&self.regs, &self.request, &self.done] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::info!("Removed stale {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Post a new request and return its token. Register files and markers
    /// left from before the request are removed first.
    pub fn request(&self) -> CaptureResult<String> {
        for path in [&self.regs, &self.done] {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::warn!("Discarded {:?} written before the request", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let token = format!("{}-{}", std::process::id(), nanos);
        write_atomic(&self.request, token.as_bytes())?;
        Ok(token)
    }

    pub fn pending_request(&self) -> CaptureResult<Option<String>> {
        match std::fs::read_to_string(&self.request) {
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until a request is posted.
    pub fn wait_for_request(&self, opts: WaitOptions) -> CaptureResult<String> {
        let started = Instant::now();
        loop {
            if let Some(token) = self.pending_request()? {
                return Ok(token);
            }
            check_deadline(started, opts)?;
            std::thread::sleep(opts.poll_interval);
        }
    }

    /// Mark the register file complete, echoing the pending token if any.
    pub fn complete(&self) -> CaptureResult<()> {
        let token = self.pending_request()?.unwrap_or_default();
        write_atomic(&self.done, token.as_bytes())
    }

    /// Block until the register file for `token` is complete.
    pub fn wait(&self, token: &str, opts: WaitOptions) -> CaptureResult<PathBuf> {
        let started = Instant::now();
        let mut last_size = None;
        loop {
            if let Ok(marker) = std::fs::read_to_string(&self.done) {
                if marker.trim() == token && self.regs.exists() {
                    tracing::info!("CPU registers dumped to {:?}", self.regs);
                    return Ok(self.regs.clone());
                }
            }

            match std::fs::metadata(&self.regs) {
                Ok(meta) if meta.len() > 0 && self.written_after_request(&meta) => {
                    if last_size == Some(meta.len()) {
                        tracing::info!(
                            "Detected CPU registers dumped to {:?} without a completion marker",
                            self.regs
                        );
                        return Ok(self.regs.clone());
                    }
                    last_size = Some(meta.len());
                }
                _ => last_size = None,
            }

            check_deadline(started, opts)?;
            std::thread::sleep(opts.poll_interval);
        }
    }

    fn written_after_request(&self, regs: &std::fs::Metadata) -> bool {
        let Ok(posted) = std::fs::metadata(&self.request).and_then(|m| m.modified()) else {
            return false;
        };
        regs.modified().is_ok_and(|written| written >= posted)
    }
}

fn check_deadline(started: Instant, opts: WaitOptions) -> CaptureResult<()> {
    match opts.timeout {
        Some(limit) if started.elapsed() >= limit => Err(CaptureError::ExternalDumpTimeout(limit)),
        _ => Ok(()),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> CaptureResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("qsnap-signal-{}-{}", tag, nonce));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn fast(timeout_ms: u64) -> WaitOptions {
        WaitOptions {
            timeout: Some(Duration::from_millis(timeout_ms)),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_marker_with_matching_token() {
        let dir = temp_dir("marker");
        let signal = CompletionSignal::in_dir(&dir);
        let token = signal.request().unwrap();
        std::fs::write(signal.regs_path(), b"{}").unwrap();
        signal.complete().unwrap();

        let path = signal.wait(&token, fast(1000)).unwrap();
        assert_eq!(path, dir.join(REGS_FILE));
    }

    #[test]
    fn test_fallback_on_stable_size() {
        let dir = temp_dir("fallback");
        let signal = CompletionSignal::in_dir(&dir);
        let token = signal.request().unwrap();
        std::fs::write(signal.regs_path(), b"{\"rax\":\"0x0\"}").unwrap();
        assert!(signal.wait(&token, fast(1000)).is_ok());
    }

    #[test]
    fn test_regs_from_before_request_are_discarded() {
        let dir = temp_dir("stale");
        let signal = CompletionSignal::in_dir(&dir);
        std::fs::write(signal.regs_path(), b"{\"rip\":\"0x1\"}").unwrap();
        std::fs::write(dir.join(DONE_FILE), b"old").unwrap();

        let token = signal.request().unwrap();
        assert!(!signal.regs_path().exists());
        assert!(!dir.join(DONE_FILE).exists());
        let err = signal.wait(&token, fast(60)).unwrap_err();
        assert!(matches!(err, CaptureError::ExternalDumpTimeout(_)));
    }

    #[test]
    fn test_fallback_needs_a_request() {
        let dir = temp_dir("no-request");
        let signal = CompletionSignal::in_dir(&dir);
        std::fs::write(signal.regs_path(), b"{\"rip\":\"0x1\"}").unwrap();
        assert!(signal.wait("t", fast(60)).is_err());
    }

    #[test]
    fn test_times_out_without_dump() {
        let dir = temp_dir("timeout");
        let signal = CompletionSignal::in_dir(&dir);
        let token = signal.request().unwrap();
        let err = signal.wait(&token, fast(50)).unwrap_err();
        assert!(matches!(err, CaptureError::ExternalDumpTimeout(_)));
    }

    #[test]
    fn test_empty_regs_file_is_not_accepted() {
        let dir = temp_dir("empty");
        let signal = CompletionSignal::in_dir(&dir);
        let token = signal.request().unwrap();
        std::fs::write(signal.regs_path(), b"").unwrap();
        assert!(signal.wait(&token, fast(60)).is_err());
    }

    #[test]
    fn test_clear_removes_leftovers() {
        let dir = temp_dir("clear");
        let signal = CompletionSignal::in_dir(&dir);
        signal.request().unwrap();
        std::fs::write(signal.regs_path(), b"{}").unwrap();
        signal.complete().unwrap();
        signal.clear().unwrap();
        assert!(!dir.join(REGS_FILE).exists());
        assert!(signal.pending_request().unwrap().is_none());
    }

    #[test]
    fn test_zero_timeout_config_waits_forever() {
        let opts = WaitOptions::from(&WaitConfig {
            timeout_secs: 0,
            poll_interval_ms: 250,
        });
        assert_eq!(opts.timeout, None);
        assert_eq!(opts.poll_interval, Duration::from_millis(250));
    }
}
