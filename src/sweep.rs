//! Parser for the sweep mini-language.
//!
//! A sweep turns one command template into a distinct value per target node.
//! The accepted form is `placeholder[{[-]begin[-[-]end][,step]}]`: the
//! placeholder is replaced in the command by the i-th term of the arithmetic
//! sequence starting at `begin`, advancing by `step`, and wrapping back to
//! `begin` whenever the next term would cross `end`. A bare placeholder with
//! no range expands to the node indices `0, 1, 2, …`.
//!
//! Examples: `i{1-3}` yields `1,2,3,1,2,…`; `i{5--1}` counts down from 5 and
//! wraps at -1; `i{0-10,2}` yields the even numbers up to 10.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SweepError {
    #[error("missing placeholder before the range")]
    MissingPlaceholder,

    #[error("not a number: {0:?}")]
    InvalidNumber(String),

    #[error("step must not be zero")]
    ZeroStep,

    #[error("too many comma-separated fields in range")]
    TooManyFields,

    #[error("malformed range: {0:?}")]
    MalformedRange(String),
}

/// A parsed sweep expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sweep {
    pub placeholder: String,
    begin: i64,
    end: i64,
    step: i64,
}

impl Sweep {
    /// Parse a sweep expression.
    ///
    /// A string without a trailing `{…}` range is a bare placeholder and
    /// expands to node indices. Anything brace-delimited must parse; a
    /// malformed range is an error rather than a literal placeholder, so the
    /// caller can tell a bad sweep from a missing one.
    pub fn parse(sweep: &str) -> Result<Self, SweepError> {
        if sweep.is_empty() {
            return Err(SweepError::MissingPlaceholder);
        }
        let indices = Self {
            placeholder: sweep.to_string(),
            begin: 0,
            end: i64::MAX,
            step: 1,
        };
        if !sweep.ends_with('}') {
            return Ok(indices);
        }
        let Some(open) = sweep.rfind('{') else {
            return Ok(indices);
        };
        if open == 0 {
            return Err(SweepError::MissingPlaceholder);
        }

        let body = &sweep[open + 1..sweep.len() - 1];
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() > 2 {
            return Err(SweepError::TooManyFields);
        }

        let mut step = 0i64;
        let mut end_given = false;
        if fields.len() == 2 {
            step = parse_int(fields[1])?;
            if step == 0 {
                return Err(SweepError::ZeroStep);
            }
        }

        // The range splits on '-', which doubles as the sign prefix; an empty
        // piece marks a negative bound.
        let pieces: Vec<&str> = fields[0].split('-').collect();
        let (begin, end) = match pieces.as_slice() {
            [b] => (parse_int(b)?, 0),
            [b, e] => {
                if b.is_empty() {
                    (parse_negative(e)?, 0)
                } else {
                    end_given = true;
                    (parse_int(b)?, parse_int(e)?)
                }
            }
            [b, m, e] => {
                end_given = true;
                if b.is_empty() {
                    (parse_negative(m)?, parse_int(e)?)
                } else if m.is_empty() {
                    (parse_int(b)?, parse_negative(e)?)
                } else {
                    return Err(SweepError::MalformedRange(fields[0].to_string()));
                }
            }
            [a, b, c, d] => {
                if !a.is_empty() && !c.is_empty() {
                    return Err(SweepError::MalformedRange(fields[0].to_string()));
                }
                end_given = true;
                (parse_negative(b)?, parse_negative(d)?)
            }
            _ => return Err(SweepError::MalformedRange(fields[0].to_string())),
        };

        let end = if end_given {
            end
        } else if step < 0 {
            i64::MIN
        } else {
            i64::MAX
        };
        if step == 0 {
            // Degenerate begin == end keeps step 0: every term is begin.
            step = match begin.cmp(&end) {
                std::cmp::Ordering::Less => 1,
                std::cmp::Ordering::Greater => -1,
                std::cmp::Ordering::Equal => 0,
            };
        }

        Ok(Self {
            placeholder: sweep[..open].to_string(),
            begin,
            end,
            step,
        })
    }

    /// Produce exactly `count` terms, wrapping back to `begin` whenever the
    /// next term would cross `end`.
    pub fn expand(&self, count: usize) -> Vec<i64> {
        let mut sequence = Vec::with_capacity(count);
        let mut term = self.begin;
        for _ in 0..count {
            sequence.push(term);
            if self.step == 0 {
                continue;
            }
            term = match term.checked_add(self.step) {
                Some(next) if self.step > 0 && next > self.end => self.begin,
                Some(next) if self.step < 0 && next < self.end => self.begin,
                Some(next) => next,
                None => self.begin,
            };
        }
        sequence
    }
}

fn parse_int(s: &str) -> Result<i64, SweepError> {
    s.parse::<i64>()
        .map_err(|_| SweepError::InvalidNumber(s.to_string()))
}

fn parse_negative(s: &str) -> Result<i64, SweepError> {
    if s.is_empty() {
        return Err(SweepError::InvalidNumber(s.to_string()));
    }
    parse_int(s).map(|v| -v)
}
