//! Offset pagination.

use serde::{Deserialize, Serialize};

/// `(skip, limit)` window over a result set. No limit means "until the end".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Page {
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Page {
    #[must_use]
    pub fn new(skip: usize, limit: Option<usize>) -> Self {
        Self { skip, limit }
    }

    /// Keeps the records inside the window.
    #[must_use]
    pub fn apply<T>(&self, records: Vec<T>) -> Vec<T> {
        let window = records.into_iter().skip(self.skip);
        match self.limit {
            Some(limit) => window.take(limit).collect(),
            None => window.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_slices_window() {
        assert_eq!(Page::new(1, Some(2)).apply(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(Page::new(2, None).apply(vec![1, 2, 3]), vec![3]);
        assert!(Page::new(5, Some(1)).apply(vec![1, 2]).is_empty());
    }
}
