use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

use seqmine_core::XrefRelation;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine crashed: {0}")]
    Crashed(String),
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The symbolic computer-algebra engine. Every operation carries a wall-clock
/// deadline the implementation must be able to enforce, because the engine is
/// untrusted with respect to termination.
pub trait GuessEngine {
    /// Propose a closed form for the given terms, or nothing.
    fn guess(&self, terms: &[i64], timeout: Duration) -> Result<Option<String>, EngineError>;

    /// Evaluate a formula at indices 0..count.
    fn eval(
        &self,
        formula: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<i64>, EngineError>;

    /// Best-effort algebraic simplification of a formula.
    fn simplify(&self, formula: &str, timeout: Duration)
        -> Result<Option<String>, EngineError>;

    /// Symbolic relation between two closed forms, if any.
    fn equivalence(
        &self,
        lhs: &str,
        rhs: &str,
        timeout: Duration,
    ) -> Result<Option<XrefRelation>, EngineError>;
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum EngineRequest<'a> {
    Guess { terms: &'a [i64] },
    Eval { formula: &'a str, count: usize },
    Simplify { formula: &'a str },
    Equiv { lhs: &'a str, rhs: &'a str },
}

#[derive(Debug, Default, Deserialize)]
struct EngineReply {
    #[serde(default)]
    formula: Option<String>,
    #[serde(default)]
    terms: Option<Vec<i64>>,
    #[serde(default)]
    simplified: Option<String>,
    #[serde(default)]
    relation: Option<String>,
}

/// Runs the configured engine command as a subprocess per call: one JSON
/// request on stdin, one JSON reply on stdout. The subprocess is the
/// isolation boundary; on deadline expiry it is killed outright, so a
/// non-terminating engine can never stall the pipeline.
pub struct SandboxedEngine {
    cmdline: String,
}

impl SandboxedEngine {
    pub fn new(cmdline: impl Into<String>) -> Self {
        Self {
            cmdline: cmdline.into(),
        }
    }

    fn call(
        &self,
        request: &EngineRequest<'_>,
        timeout: Duration,
    ) -> Result<EngineReply, EngineError> {
        let payload = serde_json::to_string(request)
            .map_err(|err| EngineError::Protocol(format!("request encoding failed: {err}")))?;

        let mut child = Command::new("bash")
            .arg("-lc")
            .arg(&self.cmdline)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // An engine that dies before reading closes the pipe; the exit
            // status below is the authoritative failure signal.
            let _ = stdin.write_all(payload.as_bytes());
            let _ = stdin.write_all(b"\n");
        }

        let stdout_pipe = child.stdout.take();
        let stdout_reader = std::thread::spawn(move || read_to_vec(stdout_pipe));
        let stderr_pipe = child.stderr.take();
        let stderr_reader = std::thread::spawn(move || read_to_vec(stderr_pipe));

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_reader.join();
                let _ = stderr_reader.join();
                return Err(EngineError::Timeout(timeout));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            let detail = String::from_utf8_lossy(&stderr).trim().to_string();
            let message = if detail.is_empty() {
                format!("engine exited with {status}")
            } else {
                truncate_chars(detail, 320)
            };
            return Err(EngineError::Crashed(message));
        }

        serde_json::from_slice(&stdout)
            .map_err(|err| EngineError::Protocol(format!("unparseable engine reply: {err}")))
    }
}

impl GuessEngine for SandboxedEngine {
    fn guess(&self, terms: &[i64], timeout: Duration) -> Result<Option<String>, EngineError> {
        let reply = self.call(&EngineRequest::Guess { terms }, timeout)?;
        Ok(reply.formula.filter(|formula| !formula.is_empty()))
    }

    fn eval(
        &self,
        formula: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<i64>, EngineError> {
        let reply = self.call(&EngineRequest::Eval { formula, count }, timeout)?;
        reply
            .terms
            .ok_or_else(|| EngineError::Protocol("eval reply missing terms".to_string()))
    }

    fn simplify(
        &self,
        formula: &str,
        timeout: Duration,
    ) -> Result<Option<String>, EngineError> {
        let reply = self.call(&EngineRequest::Simplify { formula }, timeout)?;
        Ok(reply.simplified.filter(|simplified| !simplified.is_empty()))
    }

    fn equivalence(
        &self,
        lhs: &str,
        rhs: &str,
        timeout: Duration,
    ) -> Result<Option<XrefRelation>, EngineError> {
        let reply = self.call(&EngineRequest::Equiv { lhs, rhs }, timeout)?;
        match reply.relation {
            None => Ok(None),
            Some(relation) => relation
                .parse::<XrefRelation>()
                .map(Some)
                .map_err(EngineError::Protocol),
        }
    }
}

fn read_to_vec<R: Read>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

fn truncate_chars(input: String, limit: usize) -> String {
    if input.chars().count() <= limit {
        input
    } else {
        input.chars().take(limit).collect()
    }
}
