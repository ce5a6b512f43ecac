//! Path & file trust boundary.
//!
//! Every filesystem path that crosses into the tool passes [`PathGuard`]
//! before it is read or written.

mod atomic;
pub mod path;

pub use path::{PathError, PathErrorKind, PathGuard, SecurePath};
