//! Operations that can be fanned out over a collection.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::node::Node;

/// Something that can be run against one node.
#[async_trait]
pub trait NodeOperation: Send + Sync {
    type Output: Send;

    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn run(&self, node: &Node) -> Result<Self::Output>;
}

// ============================================================================
// Node Commands
// ============================================================================

/// The node operations, as values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    IsOnline,
    IsAppRunning,
    BlockUntilOnline,
    SetPosition(String),
    StartApp(Vec<String>),
    StopApp,
    SendCommand {
        text: String,
        period: u32,
    },
    SendToApp {
        message: String,
        period: u32,
    },
    SendToAppAndExpect {
        message: String,
        pattern: String,
        timeout: Duration,
        tries: u32,
    },
    SendSequenceToApp {
        steps: Vec<(String, String)>,
        timeout: Duration,
        tries: u32,
    },
    Tail {
        lines: usize,
        raw: bool,
    },
}

/// Result of a `NodeCommand`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Answer of a query or of an expect-style command
    Flag(bool),
    /// The command was handed to the site manager
    Done,
    Lines(Vec<String>),
}

impl Outcome {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn lines(&self) -> &[String] {
        match self {
            Self::Lines(lines) => lines,
            _ => &[],
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Done => write!(f, "ok"),
            Self::Lines(lines) => write!(f, "{}", lines.join("\n")),
        }
    }
}

#[async_trait]
impl NodeOperation for NodeCommand {
    type Output = Outcome;

    fn name(&self) -> &str {
        match self {
            Self::IsOnline => "is_online",
            Self::IsAppRunning => "is_app_running",
            Self::BlockUntilOnline => "block_until_online",
            Self::SetPosition(_) => "set_position",
            Self::StartApp(_) => "start_app",
            Self::StopApp => "stop_app",
            Self::SendCommand { .. } => "send_command",
            Self::SendToApp { .. } => "send_to_app",
            Self::SendToAppAndExpect { .. } => "send_to_app_and_expect",
            Self::SendSequenceToApp { .. } => "send_sequence_to_app",
            Self::Tail { .. } => "tail",
        }
    }

    async fn run(&self, node: &Node) -> Result<Outcome> {
        match self {
            Self::IsOnline => Ok(Outcome::Flag(node.is_online())),
            Self::IsAppRunning => Ok(Outcome::Flag(node.is_app_running())),
            Self::BlockUntilOnline => {
                node.block_until_online().await;
                Ok(Outcome::Done)
            }
            Self::SetPosition(position) => {
                node.set_position(position).await?;
                Ok(Outcome::Done)
            }
            Self::StartApp(args) => {
                node.start_app(args.iter().cloned()).await?;
                Ok(Outcome::Done)
            }
            Self::StopApp => {
                node.stop_app().await?;
                Ok(Outcome::Done)
            }
            Self::SendCommand { text, period } => {
                node.send_command(text, *period).await?;
                Ok(Outcome::Done)
            }
            Self::SendToApp { message, period } => {
                node.send_to_app(message, *period).await?;
                Ok(Outcome::Done)
            }
            Self::SendToAppAndExpect {
                message,
                pattern,
                timeout,
                tries,
            } => node
                .send_to_app_and_expect(message, pattern, *timeout, *tries)
                .await
                .map(Outcome::Flag),
            Self::SendSequenceToApp {
                steps,
                timeout,
                tries,
            } => node
                .send_sequence_to_app(steps.as_slice(), *timeout, *tries)
                .await
                .map(Outcome::Flag),
            Self::Tail { lines, raw } => Ok(Outcome::Lines(node.tail(*lines, *raw))),
        }
    }
}

// ============================================================================
// Closures
// ============================================================================

/// Boxed future returned by closure operations.
pub type OperationFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// An operation backed by a closure.
pub struct FnOperation<F, T> {
    name: String,
    f: F,
    _output: PhantomData<fn() -> T>,
}

/// Wraps a closure taking an owned node handle as an operation.
pub fn from_fn<F, T>(name: impl Into<String>, f: F) -> FnOperation<F, T>
where
    F: Fn(Node) -> OperationFuture<T> + Send + Sync,
    T: Send + 'static,
{
    FnOperation {
        name: name.into(),
        f,
        _output: PhantomData,
    }
}

#[async_trait]
impl<F, T> NodeOperation for FnOperation<F, T>
where
    F: Fn(Node) -> OperationFuture<T> + Send + Sync,
    T: Send + 'static,
{
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, node: &Node) -> Result<T> {
        (self.f)(node.clone()).await
    }
}

impl<F, T> fmt::Debug for FnOperation<F, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnOperation").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::error::MonitorError;
    use crate::node::tests::context;
    use tbm_core::NodeDescriptor;

    fn node(bus: &EventBus) -> Node {
        Node::new(NodeDescriptor::new("a1", "telosb", "1", "0001"), context(bus)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_queries() {
        let bus = EventBus::new();
        let n = node(&bus);

        assert_eq!(NodeCommand::IsOnline.run(&n).await.unwrap(), Outcome::Flag(false));
        bus.dispatch("1400000000000 10.0.0.1:5000 TELOSB a1 9 {pos=0}");
        assert_eq!(NodeCommand::IsOnline.run(&n).await.unwrap(), Outcome::Flag(true));
        assert_eq!(
            NodeCommand::IsAppRunning.run(&n).await.unwrap(),
            Outcome::Flag(true)
        );
    }

    #[tokio::test]
    async fn test_tail_command() {
        let bus = EventBus::new();
        let n = node(&bus);

        let outcome = NodeCommand::Tail { lines: 3, raw: false }.run(&n).await.unwrap();
        assert_eq!(outcome.lines().len(), 1);
        assert!(outcome.to_string().contains("<<NO OUTPUT>>"));
    }

    #[tokio::test]
    async fn test_command_to_unseen_node_fails() {
        let bus = EventBus::new();
        let n = node(&bus);

        let err = NodeCommand::StopApp.run(&n).await.unwrap_err();
        assert!(matches!(err, MonitorError::NodeUnseen { .. }));
    }

    #[test]
    fn test_names() {
        assert_eq!(NodeCommand::StopApp.name(), "stop_app");
        assert_eq!(
            NodeCommand::Tail { lines: 1, raw: true }.name(),
            "tail"
        );
    }

    #[tokio::test]
    async fn test_closure_operation() {
        let bus = EventBus::new();
        let n = node(&bus);
        let op = from_fn("gid_len", |node: Node| -> OperationFuture<usize> {
            Box::pin(async move { Ok(node.gid().as_str().len()) })
        });

        assert_eq!(op.name(), "gid_len");
        assert_eq!(op.run(&n).await.unwrap(), 2);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::Flag(true).to_string(), "true");
        assert_eq!(Outcome::Done.to_string(), "ok");
        assert_eq!(
            Outcome::Lines(vec!["a".into(), "b".into()]).to_string(),
            "a\nb"
        );
    }
}
