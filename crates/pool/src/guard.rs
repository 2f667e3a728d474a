//! RAII guard for pooled connection instances.

/// RAII guard that wraps a pooled connection.
///
/// When the guard is dropped, the on-drop callback runs (returning the
/// connection to the pool, or discarding it on release). Use
/// `into_inner()` to take ownership without triggering the callback.
pub struct Guard<T> {
    resource: Option<T>,
    on_drop: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T> Guard<T> {
    /// Create a new guard wrapping `resource` with a drop callback.
    pub fn new<F>(resource: T, on_drop: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            resource: Some(resource),
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Take the resource out of the guard, preventing the drop callback.
    #[must_use]
    pub fn into_inner(mut self) -> T {
        self.on_drop.take();
        self.resource.take().expect("guard used after into_inner")
    }
}

impl<T> std::ops::Deref for Guard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("guard used after into_inner")
    }
}

impl<T> std::ops::DerefMut for Guard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("guard used after into_inner")
    }
}

impl<T> Drop for Guard<T> {
    fn drop(&mut self) {
        if let (Some(resource), Some(on_drop)) = (self.resource.take(), self.on_drop.take()) {
            on_drop(resource);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Guard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("resource", &self.resource)
            .finish()
    }
}
