use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Interning pool for package names. Every query carries thousands of
/// results but only a few hundred distinct packages; result pointers share
/// one allocation per name. The pool lives and dies with its query state.
#[derive(Debug, Default)]
pub struct StringPool {
    pool: Mutex<HashSet<Arc<str>>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical `Arc` for `s`, allocating on first sight.
    pub fn get(&self, s: &str) -> Arc<str> {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.get(s) {
            return existing.clone();
        }
        let interned: Arc<str> = Arc::from(s);
        pool.insert(interned.clone());
        interned
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_to_one_allocation() {
        let pool = StringPool::new();
        let a = pool.get("i3-wm");
        let b = pool.get("i3-wm");
        let c = pool.get("vim");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
    }
}
