// src/tree/mod.rs — Lazy search tree of effects

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::Query;

/// A decision point: one question for the oracle.
#[derive(Clone)]
pub struct Effect {
    pub query: Query,
}

impl Effect {
    pub fn new(query: Query) -> Self {
        Self { query }
    }

    pub fn name(&self) -> &str {
        &self.query.name
    }
}

/// Why a (sub)tree failed, with the corrective diagnostics gathered on the
/// way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureReason {
    pub message: String,
    pub diagnostics: Vec<String>,
}

impl FailureReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.diagnostics.is_empty() {
            write!(f, " (after {} corrective attempts)", self.diagnostics.len())?;
        }
        Ok(())
    }
}

type Continuation<T> = Arc<dyn Fn(&Value) -> Node<T> + Send + Sync>;

/// A branch: one effect plus the lazy mapping from a chosen answer to the
/// next node.
pub struct BranchNode<T> {
    pub effect: Effect,
    continue_with: Continuation<T>,
}

impl<T> BranchNode<T> {
    /// Materialize the child for a chosen (parsed) answer.
    ///
    /// Pure with respect to the strategy's own logic; the answer must have
    /// been resolved by the interpreter first. Re-invokable, so the driver
    /// can revisit the branch with a different answer while backtracking.
    pub fn child(&self, answer: &Value) -> Node<T> {
        (self.continue_with)(answer)
    }
}

impl<T> Clone for BranchNode<T> {
    fn clone(&self) -> Self {
        Self {
            effect: self.effect.clone(),
            continue_with: Arc::clone(&self.continue_with),
        }
    }
}

/// One node of the search tree, produced on demand.
///
/// The tree may be infinite; consumers must never force full
/// materialization. Constructing any node performs no oracle call.
pub enum Node<T> {
    Success(T),
    Failure(FailureReason),
    Branch(BranchNode<T>),
}

impl<T> Node<T> {
    pub fn success(value: T) -> Self {
        Node::Success(value)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Node::Failure(FailureReason::new(message))
    }

    pub fn branch(
        query: Query,
        continue_with: impl Fn(&Value) -> Node<T> + Send + Sync + 'static,
    ) -> Self {
        Node::Branch(BranchNode {
            effect: Effect::new(query),
            continue_with: Arc::new(continue_with),
        })
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Node::Branch(_))
    }
}

/// A description of a computation that, when run, yields a search tree.
///
/// Immutable once constructed; `root()` is pure, deferred construction —
/// it must not block and must not perform any oracle call.
pub trait Strategy: Send + Sync {
    type Output;

    fn root(&self) -> Node<Self::Output>;
}

/// A strategy defined by a root-producing closure. Convenient for tests and
/// small embedded strategies.
pub struct FnStrategy<T, F>
where
    F: Fn() -> Node<T> + Send + Sync,
{
    make_root: F,
}

impl<T, F> FnStrategy<T, F>
where
    F: Fn() -> Node<T> + Send + Sync,
{
    pub fn new(make_root: F) -> Self {
        Self { make_root }
    }
}

impl<T, F> Strategy for FnStrategy<T, F>
where
    F: Fn() -> Node<T> + Send + Sync,
    T: Send,
{
    type Output = T;

    fn root(&self) -> Node<T> {
        (self.make_root)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::ParserSpec;
    use crate::query::OutputFormat;

    fn question(name: &str) -> Query {
        Query::new(
            name,
            "pick a number",
            serde_json::json!({}),
            OutputFormat::Text,
            ParserSpec::raw_text(),
        )
    }

    #[test]
    fn test_branch_child_is_lazy_and_reinvokable() {
        let node: Node<i64> = Node::branch(question("pick"), |answer| {
            match answer.as_str().and_then(|s| s.parse::<i64>().ok()) {
                Some(n) => Node::success(n * 2),
                None => Node::fail("not a number"),
            }
        });

        let Node::Branch(branch) = node else {
            panic!("expected a branch")
        };

        match branch.child(&Value::String("21".into())) {
            Node::Success(n) => assert_eq!(n, 42),
            _ => panic!("expected success"),
        }
        // Revisiting with a different answer is allowed (backtracking).
        match branch.child(&Value::String("oops".into())) {
            Node::Failure(reason) => assert_eq!(reason.message, "not a number"),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn test_infinite_tree_is_fine_if_never_forced() {
        // Each answer leads to another branch forever; constructing the root
        // and one child must terminate.
        fn spiral(depth: u64) -> Node<u64> {
            Node::branch(question("next"), move |_| spiral(depth + 1))
        }

        let strategy = FnStrategy::new(|| spiral(0));
        let root = strategy.root();
        let Node::Branch(branch) = root else {
            panic!("expected a branch")
        };
        assert!(branch.child(&Value::Null).is_branch());
    }

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::new("parser exhausted")
            .with_diagnostics(vec!["d1".into(), "d2".into()]);
        let text = reason.to_string();
        assert!(text.contains("parser exhausted"));
        assert!(text.contains("2 corrective attempts"));
    }

    #[test]
    fn test_strategy_root_is_pure() {
        let strategy = FnStrategy::new(|| Node::success(7u8));
        for _ in 0..3 {
            match strategy.root() {
                Node::Success(v) => assert_eq!(v, 7),
                _ => panic!("expected success"),
            }
        }
    }
}
