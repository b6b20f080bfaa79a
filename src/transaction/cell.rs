//! Transactional fields

use super::TxAnchor;
use parking_lot::Mutex;
use std::sync::Arc;

// =============================================================================
// TxCell
// =============================================================================

#[derive(Debug)]
struct CellState<T> {
    value: T,
    committed: Option<T>,
}

/// A single field that remembers its committed value until commit
#[derive(Debug)]
pub struct TxCell<T> {
    anchor: Arc<TxAnchor>,
    state: Mutex<CellState<T>>,
}

impl<T: Clone + PartialEq> TxCell<T> {
    pub fn new(anchor: Arc<TxAnchor>, value: T) -> Self {
        Self {
            anchor,
            state: Mutex::new(CellState {
                value,
                committed: None,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.state.lock().value.clone()
    }

    /// Last committed value
    pub fn committed(&self) -> T {
        let st = self.state.lock();
        st.committed.clone().unwrap_or_else(|| st.value.clone())
    }

    /// Replace the value, returning the previous one
    pub fn set(&self, value: T) -> T {
        let old = {
            let mut st = self.state.lock();
            if st.value == value {
                return value;
            }
            if st.committed.is_none() {
                st.committed = Some(st.value.clone());
            }
            std::mem::replace(&mut st.value, value)
        };
        self.anchor.touch();
        old
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().committed.is_some()
    }

    pub fn commit(&self) {
        self.state.lock().committed = None;
    }

    pub fn rollback(&self) {
        let mut st = self.state.lock();
        if let Some(committed) = st.committed.take() {
            st.value = committed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_rollback_restores_first_value() {
        let anchor = TxAnchor::loaded();
        let cell = TxCell::new(anchor.clone(), 1u64);

        assert_eq!(cell.set(2), 1);
        assert_eq!(cell.set(3), 2);
        assert!(cell.is_dirty());
        assert!(anchor.is_dirty());
        assert_eq!(cell.committed(), 1);

        cell.rollback();
        assert_eq!(cell.get(), 1);
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_cell_same_value_is_not_a_change() {
        let anchor = TxAnchor::loaded();
        let cell = TxCell::new(anchor.clone(), "x".to_string());
        cell.set("x".to_string());
        assert!(!cell.is_dirty());
        assert!(!anchor.is_dirty());
    }
}
