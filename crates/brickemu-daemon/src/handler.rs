//! Handler outcomes, errors and argument access.

use brickemu_core::{CodecError, Value};
use thiserror::Error;

/// What a function handler decided.
///
/// Only [`Outcome::Return`] and [`Outcome::Done`] are successful calls; the
/// other variants are control flow signals, not failures.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Output values, one per field of the output format.
    Return(Vec<Value>),
    /// The handler produced no output.
    Done,
    /// Never answer this request.
    NoResponse,
    /// Answer function-not-supported (if a response is owed).
    NoSupport,
    /// Forward the request to the upstream daemon.
    Passthrough,
}

impl Outcome {
    /// Returns a single output value.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Return(vec![value.into()])
    }

    /// Returns several output values.
    #[must_use]
    pub const fn values(values: Vec<Value>) -> Self {
        Self::Return(values)
    }
}

/// Failures raised by handlers.
///
/// A failing function handler answers invalid-parameter if a response is
/// owed; a failing upstream handler disconnects the passthrough bridge.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// An argument index beyond the unpacked values was requested.
    #[error("missing argument {index}")]
    MissingArgument {
        /// Argument index.
        index: usize,
    },

    /// An argument has an unacceptable value.
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Argument index.
        index: usize,
        /// Why the value was rejected.
        reason: String,
    },

    /// A value could not be converted.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Creates an [`HandlerError::InvalidArgument`].
    #[must_use]
    pub fn invalid_argument(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            index,
            reason: reason.into(),
        }
    }
}

/// Result type for handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Unpacked handler arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    /// Wraps unpacked values.
    #[must_use]
    pub const fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if there are no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the raw value at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::MissingArgument`] if out of bounds.
    pub fn value(&self, index: usize) -> HandlerResult<&Value> {
        self.values
            .get(index)
            .ok_or(HandlerError::MissingArgument { index })
    }

    /// Converts the value at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument is missing or does not convert.
    pub fn get<'a, T>(&'a self, index: usize) -> HandlerResult<T>
    where
        T: TryFrom<&'a Value, Error = CodecError>,
    {
        let value = self.value(index)?;
        T::try_from(value).map_err(|_| HandlerError::invalid_argument(index, format!("{value:?}")))
    }

    /// Returns the string at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument is missing or not a string.
    pub fn str(&self, index: usize) -> HandlerResult<&str> {
        let value = self.value(index)?;
        value
            .as_str()
            .ok_or_else(|| HandlerError::invalid_argument(index, format!("{value:?} is not a string")))
    }

    /// Returns the character at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument is missing or not a character.
    pub fn char(&self, index: usize) -> HandlerResult<char> {
        match self.value(index)? {
            Value::Char(c) => Ok(*c),
            other => Err(HandlerError::invalid_argument(
                index,
                format!("{other:?} is not a character"),
            )),
        }
    }

    /// Consumes the arguments.
    #[must_use]
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let args = Args::new(vec![
            Value::U8(3),
            Value::from("abc"),
            Value::Char('x'),
            Value::Bool(true),
        ]);
        assert_eq!(args.len(), 4);
        assert_eq!(args.get::<u8>(0).unwrap(), 3);
        assert_eq!(args.get::<u32>(0).unwrap(), 3);
        assert_eq!(args.str(1).unwrap(), "abc");
        assert_eq!(args.char(2).unwrap(), 'x');
        assert!(args.get::<bool>(3).unwrap());
    }

    #[test]
    fn test_access_errors() {
        let args = Args::new(vec![Value::U16(300)]);
        assert_eq!(
            args.get::<u8>(1),
            Err(HandlerError::MissingArgument { index: 1 })
        );
        assert!(matches!(
            args.get::<u8>(0),
            Err(HandlerError::InvalidArgument { index: 0, .. })
        ));
        assert!(args.str(0).is_err());
        assert!(args.char(0).is_err());
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(Outcome::value(7u32), Outcome::Return(vec![Value::U32(7)]));
        assert_eq!(
            Outcome::values(vec![Value::U8(1), Value::U8(2)]),
            Outcome::Return(vec![Value::U8(1), Value::U8(2)])
        );
    }
}
