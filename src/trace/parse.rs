//! Decoding of the CSV bodies posted by the profiler tool library.
//!
//! Each row is `device_id,kernel_name,start_ns,end_ns`. Kernel names are
//! demangled symbols and usually arrive double-quoted, since they can contain
//! commas (`void foo<int, float>(...)`). A doubled quote inside a quoted field
//! is a literal quote.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use super::dispatch::Dispatch;

/// Number of fields in a trace row.
const FIELDS: usize = 4;

/// Errors that reject a whole trace payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("line {line}: expected 4 fields, found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("line {line}: unterminated quoted field")]
    UnterminatedQuote { line: usize },

    #[error("line {line}: unexpected character after closing quote")]
    TrailingAfterQuote { line: usize },

    #[error("line {line}: invalid {field} {value:?}")]
    InvalidTimestamp {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("line {line}: end_ns {end_ns} precedes start_ns {start_ns}")]
    EndBeforeStart {
        line: usize,
        start_ns: u64,
        end_ns: u64,
    },
}

/// Decodes a raw request body.
pub fn parse_body(body: &[u8]) -> Result<Vec<Dispatch>, ParseError> {
    let text = std::str::from_utf8(body).map_err(|_| ParseError::InvalidUtf8)?;
    parse_csv(text)
}

/// Decodes trace rows. Either every row parses or none are returned.
///
/// A quoted field may span line breaks; errors report the line the row
/// starts on.
pub fn parse_csv(text: &str) -> Result<Vec<Dispatch>, ParseError> {
    let mut dispatches = Vec::new();
    let mut strings = Interner::default();
    let mut fields: Vec<String> = Vec::with_capacity(FIELDS);
    let mut records = Records::new(text.trim());

    while let Some(line) = records.next_record(&mut fields)? {
        if fields.len() != FIELDS {
            return Err(ParseError::FieldCount {
                line,
                found: fields.len(),
            });
        }

        let start_ns = parse_timestamp(&fields[2], line, "start_ns")?;
        let end_ns = parse_timestamp(&fields[3], line, "end_ns")?;
        if end_ns < start_ns {
            return Err(ParseError::EndBeforeStart {
                line,
                start_ns,
                end_ns,
            });
        }

        dispatches.push(Dispatch {
            device_id: strings.intern(&fields[0]),
            kernel: strings.intern(&fields[1]),
            end_ns,
            duration_ns: end_ns - start_ns,
        });
    }

    Ok(dispatches)
}

fn parse_timestamp(field: &str, line: usize, name: &'static str) -> Result<u64, ParseError> {
    field
        .trim()
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidTimestamp {
            line,
            field: name,
            value: field.to_string(),
        })
}

/// Quote-aware record reader over a whole body.
struct Records<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Records<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    /// Reads the next non-blank record into `out` and returns its first line.
    fn next_record(&mut self, out: &mut Vec<String>) -> Result<Option<usize>, ParseError> {
        while self.chars.peek().is_some() {
            let line = self.line;
            let quoted = self.read_record(out, line)?;
            if quoted || out.len() > 1 || !out[0].trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Fills `out` with one record's fields. Returns whether any field was quoted.
    fn read_record(&mut self, out: &mut Vec<String>, line: usize) -> Result<bool, ParseError> {
        out.clear();
        let mut quoted = false;

        loop {
            let mut field = String::new();

            if self.chars.peek() == Some(&'"') {
                quoted = true;
                self.chars.next();
                loop {
                    match self.chars.next() {
                        Some('"') if self.chars.peek() == Some(&'"') => {
                            self.chars.next();
                            field.push('"');
                        }
                        Some('"') => break,
                        Some(c) => {
                            if c == '\n' {
                                self.line += 1;
                            }
                            field.push(c);
                        }
                        None => return Err(ParseError::UnterminatedQuote { line }),
                    }
                }
                out.push(field);

                match self.chars.next() {
                    None => return Ok(quoted),
                    Some(',') => {}
                    Some('\n') => {
                        self.line += 1;
                        return Ok(quoted);
                    }
                    Some('\r') if self.chars.peek() == Some(&'\n') => {
                        self.chars.next();
                        self.line += 1;
                        return Ok(quoted);
                    }
                    Some(_) => return Err(ParseError::TrailingAfterQuote { line: self.line }),
                }
            } else {
                loop {
                    match self.chars.next() {
                        None => {
                            out.push(field);
                            return Ok(quoted);
                        }
                        Some(',') => break,
                        Some('\n') => {
                            self.line += 1;
                            if field.ends_with('\r') {
                                field.pop();
                            }
                            out.push(field);
                            return Ok(quoted);
                        }
                        Some(c) => field.push(c),
                    }
                }
                out.push(field);
            }
        }
    }
}

/// Deduplicates device and kernel strings within one payload.
#[derive(Default)]
struct Interner {
    seen: HashSet<Arc<str>>,
}

impl Interner {
    fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.seen.get(value) {
            return Arc::clone(existing);
        }
        let value: Arc<str> = Arc::from(value);
        self.seen.insert(Arc::clone(&value));
        value
    }
}
