//! Tick-driven behavior-tree runtime with cooperative suspension.
//!
//! Nodes form a closed variant: composites and decorators are enum kinds,
//! leaves sit behind the [`Leaf`] trait. Ticking is synchronous; a deferred
//! leaf spawns its asynchronous work once through [`TickCtx::spawn`], parks
//! the returned `oneshot::Receiver`, and keeps answering [`Status::Running`]
//! until the result arrives. Task completion wakes the tick loop through
//! the tree's internal channel, so the loop sleeps between ticks instead of
//! spinning.
//!
//! Determinism: children tick in declared order, terminal nodes propagate
//! their cached status without revisiting children, and all state mutation
//! happens inside ticks on a single control flow.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Result of ticking a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The node has not been ticked since construction or reset.
    Invalid,
    /// The node has outstanding work.
    Running,
    /// The node finished successfully.
    Success,
    /// The node finished unsuccessfully.
    Failure,
}

impl Status {
    /// Whether the node will not change status without a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }
}

/// Per-tick context handed to every leaf.
///
/// Owns the sender half of the tree's wake channel; [`spawn`](Self::spawn)
/// is the only sanctioned way for a leaf to start asynchronous work.
pub struct TickCtx {
    waker: mpsc::UnboundedSender<()>,
}

impl TickCtx {
    fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (waker, rx) = mpsc::unbounded_channel();
        (Self { waker }, rx)
    }

    /// Spawns `fut` as a task; its result arrives on the returned receiver
    /// and the tick loop is woken when it completes.
    pub fn spawn<T, F>(&self, fut: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let waker = self.waker.clone();
        tokio::spawn(async move {
            let out = fut.await;
            let _ = tx.send(out);
            let _ = waker.send(());
        });
        rx
    }

    /// Spawns a timer that wakes the tick loop after `delay`.
    pub fn timer(&self, delay: Duration) -> oneshot::Receiver<()> {
        self.spawn(tokio::time::sleep(delay))
    }
}

/// A leaf performs work or tests a condition.
///
/// `tick` is called only while the leaf is not terminal; the first call
/// after construction or [`reset`](Self::reset) doubles as initialisation.
pub trait Leaf {
    /// Node name used in logs and debug output.
    fn name(&self) -> &str;

    /// Advances the leaf by one tick.
    fn tick(&mut self, ctx: &TickCtx) -> Status;

    /// Drops in-flight work so the result of an unabortable call is
    /// discarded. Instant leaves need not override this.
    fn cancel(&mut self) {}

    /// Clears internal progress so the next tick starts a fresh attempt.
    fn reset(&mut self) {}
}

/// Convergence policy for [`Node::parallel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelPolicy {
    /// Barrier: tick every child to convergence; succeed iff all succeeded.
    AllSuccess,
    /// Short-circuit: fail on the first child failure, cancelling the rest.
    AnyFailure,
}

enum Kind {
    Sequence {
        memory: bool,
        cursor: usize,
        children: Vec<Node>,
    },
    Fallback {
        cursor: usize,
        children: Vec<Node>,
    },
    Parallel {
        policy: ParallelPolicy,
        children: Vec<Node>,
    },
    Inverter {
        child: Box<Node>,
    },
    Retry {
        limit: u32,
        used: u32,
        give_up: Option<Box<dyn Fn() -> bool>>,
        child: Box<Node>,
    },
    Timeout {
        limit: Duration,
        deadline: Option<Instant>,
        timer: Option<oneshot::Receiver<()>>,
        child: Box<Node>,
    },
    Guard {
        pred: Box<dyn Fn() -> bool>,
        on_skip: Status,
        child: Box<Node>,
    },
    Leaf {
        leaf: Box<dyn Leaf>,
    },
}

/// A behavior-tree node: a composite, a decorator, or a leaf.
pub struct Node {
    name: String,
    status: Status,
    kind: Kind,
}

impl Node {
    /// Memoryless sequence: ticks children left to right every tick.
    pub fn sequence(name: impl Into<String>, children: Vec<Node>) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Sequence {
                memory: false,
                cursor: 0,
                children,
            },
        }
    }

    /// Memoryful sequence: resumes from the last running child.
    pub fn sequence_memory(name: impl Into<String>, children: Vec<Node>) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Sequence {
                memory: true,
                cursor: 0,
                children,
            },
        }
    }

    /// Fallback (selector): succeeds on the first succeeding child.
    pub fn fallback(name: impl Into<String>, children: Vec<Node>) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Fallback {
                cursor: 0,
                children,
            },
        }
    }

    /// Parallel composite with the given convergence policy.
    pub fn parallel(
        name: impl Into<String>,
        policy: ParallelPolicy,
        children: Vec<Node>,
    ) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Parallel { policy, children },
        }
    }

    /// Inverts the child's terminal status.
    pub fn inverter(name: impl Into<String>, child: Node) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Inverter {
                child: Box::new(child),
            },
        }
    }

    /// Retries the child up to `limit` times after a failure.
    pub fn retry(name: impl Into<String>, limit: u32, child: Node) -> Node {
        Self::retry_unless(name, limit, None, child)
    }

    /// Retries the child after a failure unless `give_up` answers true.
    pub fn retry_unless(
        name: impl Into<String>,
        limit: u32,
        give_up: Option<Box<dyn Fn() -> bool>>,
        child: Node,
    ) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Retry {
                limit,
                used: 0,
                give_up,
                child: Box::new(child),
            },
        }
    }

    /// Fails the child subtree when it runs longer than `limit`.
    pub fn timeout(name: impl Into<String>, limit: Duration, child: Node) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Timeout {
                limit,
                deadline: None,
                timer: None,
                child: Box::new(child),
            },
        }
    }

    /// Skips the child subtree to `on_skip` while `pred` answers false.
    pub fn guard(
        name: impl Into<String>,
        pred: Box<dyn Fn() -> bool>,
        on_skip: Status,
        child: Node,
    ) -> Node {
        Node {
            name: name.into(),
            status: Status::Invalid,
            kind: Kind::Guard {
                pred,
                on_skip,
                child: Box::new(child),
            },
        }
    }

    /// Wraps a domain leaf; the node takes the leaf's name.
    pub fn leaf(leaf: impl Leaf + 'static) -> Node {
        Node {
            name: leaf.name().to_string(),
            status: Status::Invalid,
            kind: Kind::Leaf {
                leaf: Box::new(leaf),
            },
        }
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status after the most recent tick.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Advances the node by one tick; terminal nodes propagate their cached
    /// status without revisiting children.
    pub fn tick(&mut self, ctx: &TickCtx) -> Status {
        if self.status.is_terminal() {
            return self.status;
        }
        let status = match &mut self.kind {
            Kind::Sequence {
                memory,
                cursor,
                children,
            } => {
                let start = if *memory { *cursor } else { 0 };
                let mut result = Status::Success;
                for (idx, child) in children.iter_mut().enumerate().skip(start) {
                    match child.tick(ctx) {
                        Status::Success => continue,
                        Status::Running => {
                            if *memory {
                                *cursor = idx;
                            }
                            result = Status::Running;
                            break;
                        }
                        _ => {
                            result = Status::Failure;
                            break;
                        }
                    }
                }
                if result.is_terminal() {
                    *cursor = 0;
                }
                result
            }
            Kind::Fallback { cursor, children } => {
                let start = *cursor;
                let mut result = Status::Failure;
                for (idx, child) in children.iter_mut().enumerate().skip(start) {
                    match child.tick(ctx) {
                        Status::Failure => continue,
                        Status::Running => {
                            *cursor = idx;
                            result = Status::Running;
                            break;
                        }
                        _ => {
                            result = Status::Success;
                            break;
                        }
                    }
                }
                if result.is_terminal() {
                    *cursor = 0;
                }
                result
            }
            Kind::Parallel { policy, children } => {
                let mut any_running = false;
                let mut any_failed = false;
                for child in children.iter_mut() {
                    let status = if child.status().is_terminal() {
                        child.status()
                    } else {
                        child.tick(ctx)
                    };
                    match status {
                        Status::Running => any_running = true,
                        Status::Failure => any_failed = true,
                        _ => {}
                    }
                }
                if *policy == ParallelPolicy::AnyFailure && any_failed {
                    for child in children.iter_mut() {
                        child.cancel();
                    }
                    Status::Failure
                } else if any_running {
                    Status::Running
                } else if any_failed {
                    Status::Failure
                } else {
                    Status::Success
                }
            }
            Kind::Inverter { child } => match child.tick(ctx) {
                Status::Success => Status::Failure,
                Status::Failure => Status::Success,
                other => other,
            },
            Kind::Retry {
                limit,
                used,
                give_up,
                child,
            } => loop {
                match child.tick(ctx) {
                    Status::Failure => {
                        let fatal = give_up.as_ref().map(|f| f()).unwrap_or(false);
                        if *used < *limit && !fatal {
                            *used += 1;
                            // Restart the attempt within the same tick so a
                            // retry never waits on an unrelated wake-up.
                            child.reset();
                            continue;
                        }
                        break Status::Failure;
                    }
                    other => break other,
                }
            },
            Kind::Timeout {
                limit,
                deadline,
                timer,
                child,
            } => {
                let now = Instant::now();
                let due = *deadline.get_or_insert(now + *limit);
                if timer.is_none() {
                    *timer = Some(ctx.spawn(tokio::time::sleep_until(due)));
                }
                if now >= due {
                    child.cancel();
                    Status::Failure
                } else {
                    let status = child.tick(ctx);
                    if status.is_terminal() {
                        *deadline = None;
                        *timer = None;
                    }
                    status
                }
            }
            Kind::Guard {
                pred,
                on_skip,
                child,
            } => {
                if pred() {
                    child.tick(ctx)
                } else {
                    child.cancel();
                    *on_skip
                }
            }
            Kind::Leaf { leaf } => leaf.tick(ctx),
        };
        self.status = status;
        status
    }

    /// Cooperatively cancels the subtree: in-flight leaf work is dropped
    /// and every running node settles to failure.
    pub fn cancel(&mut self) {
        match &mut self.kind {
            Kind::Sequence { children, .. }
            | Kind::Fallback { children, .. }
            | Kind::Parallel { children, .. } => {
                for child in children.iter_mut() {
                    child.cancel();
                }
            }
            Kind::Inverter { child } | Kind::Retry { child, .. } | Kind::Guard { child, .. } => {
                child.cancel();
            }
            Kind::Timeout {
                deadline,
                timer,
                child,
                ..
            } => {
                *deadline = None;
                *timer = None;
                child.cancel();
            }
            Kind::Leaf { leaf } => leaf.cancel(),
        }
        if self.status == Status::Running {
            self.status = Status::Failure;
        }
    }

    /// Returns the subtree to its pre-tick state.
    pub fn reset(&mut self) {
        self.status = Status::Invalid;
        match &mut self.kind {
            Kind::Sequence {
                cursor, children, ..
            }
            | Kind::Fallback { cursor, children } => {
                *cursor = 0;
                for child in children.iter_mut() {
                    child.reset();
                }
            }
            Kind::Parallel { children, .. } => {
                for child in children.iter_mut() {
                    child.reset();
                }
            }
            Kind::Inverter { child } | Kind::Guard { child, .. } => child.reset(),
            Kind::Retry { used, child, .. } => {
                *used = 0;
                child.reset();
            }
            Kind::Timeout {
                deadline,
                timer,
                child,
                ..
            } => {
                *deadline = None;
                *timer = None;
                child.reset();
            }
            Kind::Leaf { leaf } => leaf.reset(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Sequence { .. } => "Sequence",
            Kind::Fallback { .. } => "Fallback",
            Kind::Parallel { .. } => "Parallel",
            Kind::Inverter { .. } => "Inverter",
            Kind::Retry { .. } => "Retry",
            Kind::Timeout { .. } => "Timeout",
            Kind::Guard { .. } => "Guard",
            Kind::Leaf { .. } => "Leaf",
        };
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("status", &self.status)
            .finish()
    }
}

/// Owns the root node and the wake channel that drives the tick loop.
pub struct BehaviourTree {
    root: Node,
    ctx: TickCtx,
    wake_rx: mpsc::UnboundedReceiver<()>,
    ticks: u64,
}

impl BehaviourTree {
    /// Builds a tree around `root`.
    pub fn new(root: Node) -> Self {
        let (ctx, wake_rx) = TickCtx::new();
        Self {
            root,
            ctx,
            wake_rx,
            ticks: 0,
        }
    }

    /// Ticks the root once.
    pub fn tick(&mut self) -> Status {
        self.ticks += 1;
        self.root.tick(&self.ctx)
    }

    /// Number of ticks performed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Status of the root after the most recent tick.
    pub fn root_status(&self) -> Status {
        self.root.status()
    }

    /// Suspends until any pending task or timer completes, then drains
    /// coalesced wake-ups so the next tick observes all completions.
    pub async fn wait_for_activity(&mut self) {
        if self.wake_rx.recv().await.is_some() {
            while self.wake_rx.try_recv().is_ok() {}
        }
    }
}

impl fmt::Debug for BehaviourTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviourTree")
            .field("root", &self.root)
            .field("ticks", &self.ticks)
            .finish_non_exhaustive()
    }
}
