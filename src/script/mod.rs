//! Build script language
//!
//! Source text is tokenized, parsed into statements and evaluated against
//! an `Interpreter`. Verbs change the image; funcs return values.

mod ast;
mod eval;
mod lexer;
mod parser;
mod value;

pub use eval::{known_names, BuildResult, CodeResult, Evaluator};
pub use parser::{is_incomplete, parse};
pub use value::Value;
