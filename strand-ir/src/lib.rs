//! Intermediate representation and AST lowering.
//!
//! Lowering resolves every identifier to a (scope, index) slot, performs
//! closure capture analysis across frames, and desugars `while`, `for`,
//! `for..in`, `match` and pipe chains into primitive IR nodes.

mod lower;
mod node;

pub use lower::{lower, LowerError};
pub use node::*;
