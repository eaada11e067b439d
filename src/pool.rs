//! Worker-local scratch buffers.
//!
//! Traversals need small probability/regret vectors at every decision node.
//! A [`ScratchPool`] keeps freed vectors bucketed by length; [`Scratch`]
//! borrows the pool, hands out a zeroed buffer and gives it back on drop, so a
//! buffer can never be used after it has been returned.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Free lists of `f64` vectors keyed by length. Not shared between workers.
#[derive(Debug, Default)]
pub struct ScratchPool {
    free: RefCell<HashMap<usize, Vec<Vec<f64>>>>,
}

impl ScratchPool {
    pub fn new() -> ScratchPool {
        ScratchPool::default()
    }

    /// A zeroed buffer of exactly `len` entries.
    pub fn alloc(&self, len: usize) -> Scratch<'_> {
        let reused = self.free.borrow_mut().get_mut(&len).and_then(|list| list.pop());
        let buf = match reused {
            Some(mut buf) => {
                buf.iter_mut().for_each(|x| *x = 0.0);
                buf
            }
            None => vec![0.0; len],
        };
        Scratch { buf, pool: self }
    }

    /// Buffer initialised from `values`.
    pub fn alloc_from(&self, values: &[f64]) -> Scratch<'_> {
        let mut s = self.alloc(values.len());
        s.copy_from_slice(values);
        s
    }

    fn release(&self, buf: Vec<f64>) {
        self.free.borrow_mut().entry(buf.len()).or_default().push(buf);
    }

    /// Buffers currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.free.borrow().values().map(|l| l.len()).sum()
    }
}

/// A buffer on loan from a [`ScratchPool`].
#[derive(Debug)]
pub struct Scratch<'a> {
    buf: Vec<f64>,
    pool: &'a ScratchPool,
}

impl Deref for Scratch<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.buf
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.buf
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_zeroed_on_reuse() {
        let pool = ScratchPool::new();
        {
            let mut a = pool.alloc(3);
            a.copy_from_slice(&[1.0, 2.0, 3.0]);
        }
        assert_eq!(pool.idle(), 1);
        let b = pool.alloc(3);
        assert_eq!(&*b, &[0.0, 0.0, 0.0]);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn lengths_do_not_mix() {
        let pool = ScratchPool::new();
        drop(pool.alloc(2));
        let c = pool.alloc(5);
        assert_eq!(c.len(), 5);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn nested_loans_return_independently() {
        let pool = ScratchPool::new();
        let a = pool.alloc(2);
        let b = pool.alloc_from(&[0.5, 0.5]);
        assert_eq!(&*b, &[0.5, 0.5]);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }
}
