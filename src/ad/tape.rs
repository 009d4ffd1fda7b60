//! Adept-style two-stack tape for reverse-mode AD.
//!
//! The forward pass stores precomputed partial derivatives (multipliers) and
//! operand indices. The reverse sweep is one multiply-accumulate loop that
//! skips zero adjoints. A finished tape owns no thread-local state, so it can
//! be swept repeatedly (one sweep per pullback seed) and moved across threads.

use std::cell::Cell;

use super::Float;

/// Sentinel index for a constant (not recorded).
pub const CONSTANT: u32 = u32::MAX;

/// The result of a statement lives at `lhs_index`; its operands span
/// `[prev.end_plus_one .. self.end_plus_one)` in the multiplier/index stacks.
#[derive(Clone, Copy, Debug)]
struct Statement {
    lhs_index: u32,
    end_plus_one: u32,
}

#[derive(Clone, Debug)]
pub struct Tape<F: Float> {
    statements: Vec<Statement>,
    multipliers: Vec<F>,
    indices: Vec<u32>,
    num_variables: u32,
}

impl<F: Float> Default for Tape<F> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<F: Float> Tape<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tape sized for roughly `est_ops` recorded operations.
    pub fn with_capacity(est_ops: usize) -> Self {
        let mut statements = Vec::with_capacity(est_ops + 1);
        // Sentinel so that `statements[i - 1].end_plus_one` is valid for i >= 1.
        statements.push(Statement {
            lhs_index: 0,
            end_plus_one: 0,
        });
        Tape {
            statements,
            multipliers: Vec::with_capacity(est_ops * 2),
            indices: Vec::with_capacity(est_ops * 2),
            num_variables: 0,
        }
    }

    /// Register an independent variable. Returns `(index, value)`.
    ///
    /// Inputs push no statement: they are leaves and their adjoints survive
    /// the sweep.
    #[inline]
    pub fn new_variable(&mut self, value: F) -> (u32, F) {
        let idx = self.num_variables;
        self.num_variables += 1;
        (idx, value)
    }

    #[inline]
    pub fn num_variables(&self) -> usize {
        self.num_variables as usize
    }

    /// Number of recorded (non-input) statements.
    #[inline]
    pub fn num_statements(&self) -> usize {
        self.statements.len() - 1
    }

    /// Record `result = f(operand)` with `multiplier = df/d(operand)`.
    #[inline]
    pub fn push_unary(&mut self, operand_idx: u32, multiplier: F) -> u32 {
        let result_idx = self.num_variables;
        self.num_variables += 1;

        if operand_idx != CONSTANT {
            self.multipliers.push(multiplier);
            self.indices.push(operand_idx);
        }

        self.statements.push(Statement {
            lhs_index: result_idx,
            end_plus_one: self.multipliers.len() as u32,
        });
        result_idx
    }

    /// Record a binary operation with precomputed partials.
    #[inline]
    pub fn push_binary(&mut self, lhs_idx: u32, lhs_mult: F, rhs_idx: u32, rhs_mult: F) -> u32 {
        let result_idx = self.num_variables;
        self.num_variables += 1;

        if lhs_idx != CONSTANT {
            self.multipliers.push(lhs_mult);
            self.indices.push(lhs_idx);
        }
        if rhs_idx != CONSTANT {
            self.multipliers.push(rhs_mult);
            self.indices.push(rhs_idx);
        }

        self.statements.push(Statement {
            lhs_index: result_idx,
            end_plus_one: self.multipliers.len() as u32,
        });
        result_idx
    }

    /// Reverse sweep seeding the adjoint of `seed_index` with 1.
    pub fn reverse(&self, seed_index: u32) -> Vec<F> {
        self.reverse_seeded(&[(seed_index, F::one())])
    }

    /// Reverse sweep with custom adjoint seeds. Seeds on the same index add up.
    pub fn reverse_seeded(&self, seeds: &[(u32, F)]) -> Vec<F> {
        let mut adjoints = vec![F::zero(); self.num_variables as usize];
        for &(idx, seed) in seeds {
            adjoints[idx as usize] = adjoints[idx as usize] + seed;
        }
        self.sweep(&mut adjoints);
        adjoints
    }

    fn sweep(&self, adjoints: &mut [F]) {
        for i in (1..self.statements.len()).rev() {
            let stmt = self.statements[i];
            let a = adjoints[stmt.lhs_index as usize];
            if a == F::zero() {
                continue;
            }
            adjoints[stmt.lhs_index as usize] = F::zero();
            let start = self.statements[i - 1].end_plus_one as usize;
            let end = stmt.end_plus_one as usize;
            for j in start..end {
                let k = self.indices[j] as usize;
                adjoints[k] = adjoints[k] + self.multipliers[j] * a;
            }
        }
    }
}

thread_local! {
    static TAPE_F32: Cell<*mut Tape<f32>> = const { Cell::new(std::ptr::null_mut()) };
    static TAPE_F64: Cell<*mut Tape<f64>> = const { Cell::new(std::ptr::null_mut()) };
}

/// Selects the thread-local slot for a float type.
pub trait TapeThreadLocal: Float {
    fn cell() -> &'static std::thread::LocalKey<Cell<*mut Tape<Self>>>;
}

impl TapeThreadLocal for f32 {
    fn cell() -> &'static std::thread::LocalKey<Cell<*mut Tape<Self>>> {
        &TAPE_F32
    }
}

impl TapeThreadLocal for f64 {
    fn cell() -> &'static std::thread::LocalKey<Cell<*mut Tape<Self>>> {
        &TAPE_F64
    }
}

/// Access the active tape for the current thread.
///
/// Panics if no tape is active: reverse-mode values may only be combined
/// inside one of the closure-based entry points in [`crate::ad`].
#[inline]
pub fn with_active_tape<F: TapeThreadLocal, R>(f: impl FnOnce(&mut Tape<F>) -> R) -> R {
    F::cell().with(|cell| {
        let ptr = cell.get();
        assert!(
            !ptr.is_null(),
            "no active tape; use ad::grad, ad::vjp or ad::pullback"
        );
        // SAFETY: TapeGuard keeps the pointee alive for the whole closure
        // scope, and the thread-local makes this the only live `&mut`.
        let tape = unsafe { &mut *ptr };
        f(tape)
    })
}

/// Installs a tape as the thread-local active tape and restores the previous
/// one on drop.
pub struct TapeGuard<F: TapeThreadLocal> {
    prev: *mut Tape<F>,
}

impl<F: TapeThreadLocal> TapeGuard<F> {
    pub fn new(tape: &mut Tape<F>) -> Self {
        let prev = F::cell().with(|cell| {
            let prev = cell.get();
            cell.set(tape as *mut Tape<F>);
            prev
        });
        TapeGuard { prev }
    }
}

impl<F: TapeThreadLocal> Drop for TapeGuard<F> {
    fn drop(&mut self) {
        F::cell().with(|cell| {
            cell.set(self.prev);
        });
    }
}
