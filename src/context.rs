//! Request-scoped values and cancellation threaded through a step tree.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// Type-safe context key wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(String);

impl ContextKey {
    /// Creates a new ContextKey.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ContextKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for ContextKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

type Values = HashMap<ContextKey, Arc<dyn Any + Send + Sync>>;

/// One link in a chain of cancellation signals.
///
/// A node counts as cancelled when its own flag is set or when any ancestor
/// is cancelled.
struct CancelNode {
    flag: watch::Sender<bool>,
    parent: Option<Arc<CancelNode>>,
}

impl CancelNode {
    fn new(parent: Option<Arc<CancelNode>>) -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag, parent }
    }

    fn cancel(&self) {
        self.flag.send_if_modified(|cancelled| !std::mem::replace(cancelled, true));
    }

    fn is_set(&self) -> bool {
        *self.flag.borrow()
    }

    fn is_cancelled(&self) -> bool {
        self.is_set() || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.flag.subscribe();
            let own = async move {
                loop {
                    let set = *rx.borrow_and_update();
                    if set {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            };
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

/// Immutable carrier of request-scoped values and a cancellation signal.
///
/// Cloning is cheap. Deriving a context with [`Context::with_value`] or
/// [`Context::with_cancel`] never changes the parent, and every derived
/// context observes the cancellation of its ancestors.
///
/// # Examples
///
/// ```
/// use kumitate::Context;
///
/// let root = Context::background();
/// let (ctx, handle) = root.with_cancel();
/// let ctx = ctx.with_value("tenant", "acme".to_string());
///
/// assert_eq!(ctx.value::<String>("tenant"), Some(&"acme".to_string()));
/// assert!(root.value::<String>("tenant").is_none());
///
/// handle.cancel();
/// assert!(ctx.is_cancelled());
/// assert!(!root.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    values: Arc<Values>,
    cancel: Option<Arc<CancelNode>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Context {
    /// Returns an empty context that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Same as [`Context::background`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a derived context carrying `value` under `key`.
    ///
    /// If the key already exists, the derived context shadows the previous value.
    pub fn with_value<T: Any + Send + Sync>(&self, key: impl Into<ContextKey>, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), Arc::new(value));
        Self {
            values: Arc::new(values),
            cancel: self.cancel.clone(),
        }
    }

    /// Returns a reference to the value for the given key.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn value<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns `true` if the context carries a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns an iterator over all keys in the context.
    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.values.keys()
    }

    /// Returns the number of values carried.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the context carries no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns a cancellable derivation of this context and the handle that cancels it.
    ///
    /// Cancelling the handle does not affect `self`; cancelling `self` (or any
    /// of its ancestors) cancels the derived context.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let node = Arc::new(CancelNode::new(self.cancel.clone()));
        let ctx = Self {
            values: Arc::clone(&self.values),
            cancel: Some(Arc::clone(&node)),
        };
        (ctx, CancelHandle { node })
    }

    /// Returns `true` once this context or an ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|node| node.is_cancelled())
    }

    /// Resolves once this context is cancelled.
    ///
    /// Never resolves for a context without a cancellation signal.
    pub async fn cancelled(&self) {
        match &self.cancel {
            Some(node) => node.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

/// Cancels the context returned alongside it by [`Context::with_cancel`].
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<CancelNode>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.node.is_set())
            .finish()
    }
}

impl CancelHandle {
    /// Cancels the associated context. Calling it again has no effect.
    pub fn cancel(&self) {
        self.node.cancel();
    }

    /// Returns `true` if this handle has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.node.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_values_are_inherited_not_shared() {
        let parent = Context::new().with_value("a", 1u32);
        let child = parent.with_value("b", "two".to_string());

        assert_eq!(child.value::<u32>("a"), Some(&1));
        assert_eq!(child.value::<String>("b"), Some(&"two".to_string()));
        assert!(!parent.contains_key("b"));
        assert_eq!(parent.len(), 1);
        assert_eq!(child.len(), 2);

        // Wrong type returns None
        assert_eq!(child.value::<String>("a"), None);
    }

    #[test]
    fn test_background_is_never_cancelled() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_cancel_propagates_down_only() {
        let (parent, parent_handle) = Context::background().with_cancel();
        let (child, child_handle) = parent.with_cancel();

        child_handle.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (sibling, _keep) = parent.with_cancel();
        parent_handle.cancel();
        assert!(parent.is_cancelled());
        assert!(sibling.is_cancelled());
        assert!(sibling.with_value("k", 1u8).is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        let mut waiter = task::spawn(ctx.cancelled());
        assert_pending!(waiter.poll());

        handle.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_on_ancestor_cancel() {
        let (parent, handle) = Context::background().with_cancel();
        let (child, _child_handle) = parent.with_value("k", 1u8).with_cancel();

        let mut waiter = task::spawn(child.cancelled());
        assert_pending!(waiter.poll());

        handle.cancel();
        assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();
        ctx.cancelled().await;
    }
}
