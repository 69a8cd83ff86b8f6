//! Admission check outcomes and store result decoding.

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acquire {
    /// Permit granted
    Success,
    /// Ceiling exceeded
    Failure,
    /// The check could not be evaluated
    Exception,
}

impl Acquire {
    /// Wire code returned by the store procedures.
    pub fn code(&self) -> i64 {
        match self {
            Acquire::Success => 1,
            Acquire::Failure => 0,
            Acquire::Exception => -1,
        }
    }

    /// Map a wire code back. Unknown codes are exceptions.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Acquire::Success,
            0 => Acquire::Failure,
            _ => Acquire::Exception,
        }
    }
}

/// Decoded result of a store procedure: the outcome plus a numeric payload
/// (current counter value or remaining tokens) kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalResult {
    pub code: Acquire,
    pub num: i64,
}

impl EvalResult {
    pub fn new(code: Acquire, num: i64) -> Self {
        Self { code, num }
    }

    pub fn exception() -> Self {
        Self::new(Acquire::Exception, 0)
    }

    /// Decode a raw `[code, payload]` reply.
    ///
    /// Anything that is not exactly two values decodes as an exception.
    pub fn decode(raw: &[i64]) -> Self {
        match raw {
            [code, num] => Self::new(Acquire::from_code(*code), *num),
            _ => Self::exception(),
        }
    }

    /// Encode as a raw reply.
    pub fn encode(&self) -> Vec<i64> {
        vec![self.code.code(), self.num]
    }
}
