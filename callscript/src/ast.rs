// AST for the restricted call language.
//
// The shape of this tree is the safety property: there is nothing here that
// could express control flow, arithmetic, attribute access or nested calls.

use crate::values::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `name = <call | literal | other_name>`
    Assign { name: String, value: RValue },
    /// A bare expression statement. Only calls have an effect.
    Expr(RValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RValue {
    Call(Call),
    Literal(Value),
    Name(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub function: String,
    pub args: Vec<Arg>,
    pub kwargs: Vec<(String, Arg)>,
}

/// A call argument: a literal or a previously bound variable name.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Name(String),
}

impl Program {
    /// Number of call expressions in the program.
    pub fn call_count(&self) -> usize {
        self.statements
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Stmt::Assign {
                        value: RValue::Call(_),
                        ..
                    } | Stmt::Expr(RValue::Call(_))
                )
            })
            .count()
    }
}
