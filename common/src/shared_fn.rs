use std::sync::Arc;

/// An optional, cheaply clonable function handle.
///
/// Generic over the (usually unsized `dyn Fn`) signature `F`. Used for
/// callbacks that may or may not be installed, such as progress sinks.
pub enum SharedFn<F: ?Sized + Send + Sync + 'static> {
    None,
    Some(Arc<F>),
}

impl<F: ?Sized + Send + Sync + 'static> Clone for SharedFn<F> {
    fn clone(&self) -> Self {
        match self {
            SharedFn::None => SharedFn::None,
            SharedFn::Some(f) => SharedFn::Some(Arc::clone(f)),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> Default for SharedFn<F> {
    fn default() -> Self {
        SharedFn::None
    }
}

impl<F: ?Sized + Send + Sync + 'static> SharedFn<F> {
    pub fn new(f: Arc<F>) -> Self {
        SharedFn::Some(f)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, SharedFn::None)
    }

    pub fn is_some(&self) -> bool {
        matches!(self, SharedFn::Some(_))
    }

    pub fn as_ref(&self) -> Option<&Arc<F>> {
        match self {
            SharedFn::None => None,
            SharedFn::Some(f) => Some(f),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> std::fmt::Debug for SharedFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SharedFn::None => write!(f, "SharedFn::None"),
            SharedFn::Some(_) => write!(f, "SharedFn::Some(...)"),
        }
    }
}

impl<F: ?Sized + Send + Sync + 'static> From<Arc<F>> for SharedFn<F> {
    fn from(f: Arc<F>) -> Self {
        SharedFn::Some(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = SharedFn<dyn Fn(u32) -> u32 + Send + Sync>;

    #[test]
    fn test_default_is_none() {
        let f: Callback = SharedFn::default();
        assert!(f.is_none());
        assert!(f.as_ref().is_none());
    }

    #[test]
    fn test_clone_shares_function() {
        let f: Callback = SharedFn::new(Arc::new(|x: u32| x + 1));
        let g = f.clone();
        assert!(g.is_some());
        let call = g.as_ref().expect("callback should be set");
        assert_eq!(call(41), 42);
        if let (SharedFn::Some(a), SharedFn::Some(b)) = (&f, &g) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_debug_format() {
        let f: Callback = SharedFn::None;
        assert_eq!(format!("{f:?}"), "SharedFn::None");
    }
}
