use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};

use super::{Result, ScpiError};

pub const ERROR_QUEUE_CAPACITY: usize = 10;

/// One parsed command, e.g. `MEAS:POW2?` or `SENS:FREQ 433`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiCommand {
    /// Upper-cased keywords, channel suffix removed.
    pub keywords: Vec<String>,
    pub is_query: bool,
    /// Trailing digit of the last keyword (`POW2` -> 2).
    pub channel: Option<u8>,
    pub parameter: Option<String>,
}

impl ScpiCommand {
    pub fn parse(text: &str) -> Self {
        let raw = text.trim();
        let is_query = raw.ends_with('?');
        let body = if is_query { &raw[..raw.len() - 1] } else { raw };

        let (header, parameter) = match body.split_once(char::is_whitespace) {
            Some((header, rest)) => {
                let rest = rest.trim();
                (header, (!rest.is_empty()).then(|| rest.to_string()))
            }
            None => (body, None),
        };

        let mut keywords: Vec<String> = if header.starts_with('*') {
            vec![header.to_ascii_uppercase()]
        } else {
            header
                .strip_prefix(':')
                .unwrap_or(header)
                .split(':')
                .map(str::to_ascii_uppercase)
                .collect()
        };

        let mut channel = None;
        if let Some(last) = keywords.last_mut() {
            if let Some(digit) = last.chars().last().and_then(|c| c.to_digit(10)) {
                last.pop();
                channel = Some(digit as u8);
            }
        }

        ScpiCommand {
            keywords,
            is_query,
            channel,
            parameter,
        }
    }

    /// True when every keyword abbreviates the corresponding keyword of
    /// `pattern` (e.g. `MEASure:POWer`) and the keyword counts agree.
    pub fn matches(&self, pattern: &str) -> bool {
        let parts: Vec<&str> = pattern.split(':').collect();
        parts.len() == self.keywords.len()
            && self
                .keywords
                .iter()
                .zip(parts)
                .all(|(kw, part)| keyword_matches(kw, part))
    }

    pub fn param_str(&self) -> Option<&str> {
        self.parameter.as_deref()
    }

    /// Numeric parameter; `None` when absent, an error when malformed.
    pub fn param_f64(&self) -> Result<Option<f64>> {
        self.parameter
            .as_deref()
            .map(|p| {
                p.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ScpiError::InvalidParameter(p.to_string()))
            })
            .transpose()
    }

    /// Integer parameter; accepts decimal notation and truncates toward zero.
    pub fn param_i64(&self) -> Result<Option<i64>> {
        Ok(self.param_f64()?.map(|v| v.trunc() as i64))
    }
}

impl fmt::Display for ScpiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keywords.join(":"))?;
        if let Some(ch) = self.channel {
            write!(f, "{ch}")?;
        }
        if self.is_query {
            f.write_str("?")?;
        }
        if let Some(p) = &self.parameter {
            write!(f, " {p}")?;
        }
        Ok(())
    }
}

/// SCPI short/long form matching. The upper-case letters of `pattern` are
/// the required short form; any longer prefix of the long form is accepted.
pub fn keyword_matches(keyword: &str, pattern: &str) -> bool {
    let required = pattern.chars().filter(char::is_ascii_uppercase).count();
    let full = pattern.to_ascii_uppercase();
    let keyword = keyword.to_ascii_uppercase();
    keyword.len() >= required && full.starts_with(&keyword)
}

pub type Handler<C> = fn(&mut C, &mut ErrorQueue, &ScpiCommand) -> Result<Option<String>>;

pub struct CommandEntry<C> {
    pub pattern: &'static str,
    exec: Handler<C>,
    query: Handler<C>,
}

/// Command table, built once before the engine starts.
pub struct Registry<C> {
    entries: Vec<CommandEntry<C>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Registry {
            entries: Vec::new(),
        }
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, pattern: &'static str, exec: Handler<C>, query: Handler<C>) -> Self {
        self.entries.push(CommandEntry {
            pattern,
            exec,
            query,
        });
        self
    }

    /// First entry matching `command`; patterns are expected not to overlap.
    pub fn lookup(&self, command: &ScpiCommand) -> Option<&CommandEntry<C>> {
        self.entries.iter().find(|e| command.matches(e.pattern))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedError {
    pub code: i32,
    pub message: String,
}

/// Bounded FIFO of instrument errors; the oldest entry is dropped on overflow.
#[derive(Debug, Default)]
pub struct ErrorQueue {
    entries: VecDeque<QueuedError>,
}

impl ErrorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, code: i32, message: impl Into<String>) {
        let message = message.into();
        debug!("Queueing error {}: {}", code, message);
        if self.entries.len() == ERROR_QUEUE_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(QueuedError { code, message });
    }

    pub fn push_error(&mut self, error: &ScpiError) {
        self.push(error.code(), error.to_string());
    }

    pub fn pop(&mut self) -> Option<QueuedError> {
        self.entries.pop_front()
    }

    /// Oldest error as `code,"message"`, or `0,"No error"`.
    pub fn pop_formatted(&mut self) -> String {
        match self.pop() {
            Some(e) => format!("{},\"{}\"", e.code, e.message),
            None => "0,\"No error\"".to_string(),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parses and dispatches command lines against a fixed registry.
pub struct ScpiEngine<C> {
    registry: Registry<C>,
    errors: ErrorQueue,
}

impl<C> ScpiEngine<C> {
    pub fn new(registry: Registry<C>) -> Self {
        ScpiEngine {
            registry,
            errors: ErrorQueue::new(),
        }
    }

    pub fn errors(&self) -> &ErrorQueue {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorQueue {
        &mut self.errors
    }

    /// Runs one command. Failures end up in the error queue, never in the
    /// return value.
    pub fn execute(&mut self, ctx: &mut C, text: &str) -> Option<String> {
        let command = ScpiCommand::parse(text);
        let Some(entry) = self.registry.lookup(&command) else {
            warn!("Unknown command: {}", text.trim());
            self.errors.push_error(&ScpiError::UnknownCommand);
            return None;
        };

        debug!("Dispatching {} to {}", command, entry.pattern);
        let handler = if command.is_query { entry.query } else { entry.exec };
        match handler(ctx, &mut self.errors, &command) {
            Ok(response) => response,
            Err(e) => {
                warn!("Command {} failed: {}", command, e);
                self.errors.push_error(&e);
                None
            }
        }
    }

    /// Runs every `;`-separated command of `line`. Responses are joined with
    /// `;` and newline-terminated; a line without responses yields `None`.
    pub fn process_line(&mut self, ctx: &mut C, line: &str) -> Option<String> {
        let responses: Vec<String> = line
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| self.execute(ctx, part))
            .collect();

        if responses.is_empty() {
            None
        } else {
            Some(format!("{}\n", responses.join(";")))
        }
    }
}
