// The seam between the language and whatever executes the calls.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::values::Value;

/// Resolves and executes one function call on behalf of the interpreter.
///
/// The interpreter knows nothing about registries, scopes or networking;
/// the host owns name resolution, admission control and timeouts, and its
/// error type flows through [`EvalError::Host`](crate::error::EvalError)
/// unchanged.
#[async_trait]
pub trait CallHost {
    type Error: Send;

    async fn invoke(
        &self,
        function: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> Result<Value, Self::Error>;
}
