//! Callscript - a deliberately weak call/assignment language.
//!
//! A program is a sequence of statements; each statement either binds a name
//! or evaluates a single flat function call. There is no arithmetic, no
//! control flow, no attribute access and no nesting, which is what makes it
//! safe to hand to an untrusted caller such as an LLM: the grammar cannot
//! express anything beyond "look up a whitelisted function, call it, chain
//! results".
//!
//! The language is execution-agnostic. Embedders implement [`CallHost`] to
//! decide how a call is resolved and run; see the `plexus` crate for the
//! full registry/dispatch/network runtime built on top of this seam.

pub mod ast;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod parser;
pub mod values;

pub use ast::{Arg, Call, Program, RValue, Stmt};
pub use error::{EvalError, ParseError};
pub use host::CallHost;
pub use interpreter::run_program;
pub use parser::parse_program;
pub use values::{TaggedValue, Value};
