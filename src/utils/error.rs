//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

/// Customized error type for the viewstamped crate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ViewstampedError(pub String);

impl ViewstampedError {
    pub fn msg(msg: impl ToString) -> Self {
        ViewstampedError(msg.to_string())
    }
}

impl fmt::Display for ViewstampedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for ViewstampedError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `ViewstampedError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ViewstampedError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                ViewstampedError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `ViewstampedError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ViewstampedError {
            fn from(e: $error) -> ViewstampedError {
                ViewstampedError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::time::error::Elapsed);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
