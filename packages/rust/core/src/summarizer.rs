//! Summarization backends.
//!
//! [`LeadSummarizer`] is a dependency-free extractive fallback.
//! [`BridgeSummarizer`] drives an external model process over a JSON-lines
//! stdin/stdout protocol:
//!
//! ```text
//! <- {"type":"ready"}
//! -> {"type":"summarize","id":"req-1","text":"summarize: ...","params":{...}}
//! <- {"type":"result","id":"req-1","summary":"..."}   or
//! <- {"type":"error","id":"req-1","error":"..."}
//! -> {"type":"shutdown"}
//! ```

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, info, warn};

use newsdigest_shared::{
    NewsDigestError, Result, SUMMARIZE_PREFIX, SummarizerBackend, SummarizerConfig,
};

/// Text → summary. Errors are turned into failure sentinels by the caller.
pub trait Summarizer: Send {
    fn summarize(&mut self, text: &str) -> Result<String>;

    /// Release any external resources. Called once after the last summary.
    fn shutdown(&mut self) {}

    fn name(&self) -> &str;
}

/// Build the backend selected in configuration.
pub fn from_config(config: &SummarizerConfig) -> Result<Box<dyn Summarizer>> {
    Ok(match config.backend {
        SummarizerBackend::Lead => Box::new(LeadSummarizer::new(config)),
        SummarizerBackend::Bridge => Box::new(BridgeSummarizer::spawn(config)?),
    })
}

const ELLIPSIS: &str = "...";

/// Cut `text` to at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ---------------------------------------------------------------------------
// LeadSummarizer
// ---------------------------------------------------------------------------

/// Extractive summary made of the leading sentences of the article.
pub struct LeadSummarizer {
    min_chars: usize,
    max_chars: usize,
}

impl LeadSummarizer {
    pub fn new(config: &SummarizerConfig) -> Self {
        Self {
            min_chars: config.lead_min_chars,
            max_chars: config.lead_max_chars.max(1),
        }
    }
}

impl Summarizer for LeadSummarizer {
    fn summarize(&mut self, text: &str) -> Result<String> {
        let body = text.strip_prefix(SUMMARIZE_PREFIX).unwrap_or(text).trim();
        if body.is_empty() {
            return Err(NewsDigestError::Summarization("empty input text".into()));
        }

        let mut summary = String::new();
        for sentence in sentences(body) {
            let separator = usize::from(!summary.is_empty());
            let needed = separator + sentence.chars().count();
            if summary.chars().count() + needed > self.max_chars {
                break;
            }
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str(sentence);
            if summary.chars().count() >= self.min_chars {
                break;
            }
        }

        if summary.is_empty() && self.max_chars <= ELLIPSIS.len() {
            // No room for an ellipsis.
            summary = truncate_chars(body, self.max_chars).to_string();
        } else if summary.is_empty() {
            // First sentence alone is too long: cut it at a word boundary.
            let cut = truncate_chars(body, self.max_chars - ELLIPSIS.len());
            let cut = cut.rsplit_once(' ').map_or(cut, |(head, _)| head);
            summary = format!("{}{ELLIPSIS}", cut.trim_end());
        }
        Ok(summary)
    }

    fn name(&self) -> &str {
        "lead"
    }
}

/// Split on `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next, n)) = chars.peek() {
                if n.is_whitespace() {
                    let sentence = text[start..=i].trim();
                    if !sentence.is_empty() {
                        out.push(sentence);
                    }
                    start = next;
                }
            }
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

// ---------------------------------------------------------------------------
// Bridge protocol
// ---------------------------------------------------------------------------

/// Generation parameters forwarded with every request.
#[derive(Debug, Clone, serde::Serialize)]
struct ModelParams {
    model_name: String,
    max_new_tokens: u32,
    min_new_tokens: u32,
    num_beams: u32,
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Summarize {
        id: String,
        text: &'a str,
        params: &'a ModelParams,
    },
    Shutdown,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        summary: String,
    },
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// BridgeSummarizer
// ---------------------------------------------------------------------------

/// Summarizer backed by an external model process.
pub struct BridgeSummarizer {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    params: ModelParams,
    max_input_chars: usize,
    request_counter: u64,
    closed: bool,
}

impl BridgeSummarizer {
    /// Spawn the bridge and wait for its ready message.
    pub fn spawn(config: &SummarizerConfig) -> Result<Self> {
        info!(cmd = %config.bridge_cmd, args = ?config.bridge_args, "spawning summarizer bridge");

        let mut child = Command::new(&config.bridge_cmd)
            .args(&config.bridge_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                NewsDigestError::Summarization(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.bridge_cmd
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            NewsDigestError::Summarization("failed to capture bridge stdin".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            NewsDigestError::Summarization("failed to capture bridge stdout".into())
        })?;

        let mut bridge = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            params: ModelParams {
                model_name: config.model_name.clone(),
                max_new_tokens: config.max_new_tokens,
                min_new_tokens: config.min_new_tokens,
                num_beams: config.num_beams,
            },
            max_input_chars: config.max_input_chars,
            request_counter: 0,
            closed: false,
        };

        match bridge.read_message()? {
            ResponseMessage::Ready => {
                info!(model = %bridge.params.model_name, "summarizer bridge is ready");
                Ok(bridge)
            }
            other => Err(NewsDigestError::Summarization(format!(
                "expected ready message, got {other:?}"
            ))),
        }
    }

    fn read_message(&mut self) -> Result<ResponseMessage> {
        let mut line = String::new();
        self.reader
            .read_line(&mut line)
            .map_err(|e| NewsDigestError::Summarization(format!("bridge read error: {e}")))?;

        if line.is_empty() {
            return Err(NewsDigestError::Summarization(
                "bridge closed stdout unexpectedly".into(),
            ));
        }

        serde_json::from_str(line.trim()).map_err(|e| {
            NewsDigestError::Summarization(format!(
                "invalid bridge message: {e} (got: {})",
                truncate_chars(line.trim(), 200)
            ))
        })
    }

    fn send(&mut self, message: &RequestMessage<'_>) -> Result<()> {
        let json = serde_json::to_string(message).map_err(|e| {
            NewsDigestError::Summarization(format!("failed to serialize request: {e}"))
        })?;
        writeln!(self.stdin, "{json}").map_err(|e| {
            NewsDigestError::Summarization(format!("failed to write to bridge stdin: {e}"))
        })?;
        self.stdin.flush().map_err(|e| {
            NewsDigestError::Summarization(format!("failed to flush bridge stdin: {e}"))
        })
    }
}

impl Summarizer for BridgeSummarizer {
    fn summarize(&mut self, text: &str) -> Result<String> {
        if self.closed {
            return Err(NewsDigestError::Summarization("bridge already shut down".into()));
        }
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);

        let input = truncate_chars(text, self.max_input_chars);
        let params = self.params.clone();
        self.send(&RequestMessage::Summarize {
            id: id.clone(),
            text: input,
            params: &params,
        })?;

        match self.read_message()? {
            ResponseMessage::Result {
                id: resp_id,
                summary,
            } => {
                if resp_id != id {
                    return Err(NewsDigestError::Summarization(format!(
                        "response id {resp_id} does not match request {id}"
                    )));
                }
                let summary = summary.trim();
                if summary.is_empty() {
                    return Err(NewsDigestError::Summarization("model returned an empty summary".into()));
                }
                debug!(%id, chars = summary.len(), "summary received");
                Ok(summary.to_string())
            }
            ResponseMessage::Error { error, .. } => Err(NewsDigestError::Summarization(error)),
            ResponseMessage::Ready => Err(NewsDigestError::Summarization(
                "unexpected ready message during summarization".into(),
            )),
        }
    }

    /// Send shutdown and wait for the bridge to exit.
    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.send(&RequestMessage::Shutdown) {
            warn!(error = %e, "could not send shutdown to bridge");
        }
        match self.child.wait() {
            Ok(status) => info!(?status, "summarizer bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }

    fn name(&self) -> &str {
        "bridge"
    }
}

impl Drop for BridgeSummarizer {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
