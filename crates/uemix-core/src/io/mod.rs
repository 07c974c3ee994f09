//! Sample payload encoding.
//!
//! [`IqFormat`] is the single place where blocks become bytes and back, used
//! by the TCP endpoints and by the configuration layer.

mod format;

pub use format::{FormatError, IqFormat};
