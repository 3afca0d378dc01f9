use crate::api::DebugApi;
use crate::iterator::{CoordIterator, Granularity, Select};
use crate::state::System;
use crate::{Error, Result};
use std::cmp::Ordering;

/// A 3-dimensional grid or block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    #[must_use]
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of cells in a space of this extent.
    #[must_use]
    pub fn count(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// Sort key in logical-lexicographic order (z major, x minor).
    #[must_use]
    fn zyx(&self) -> (u32, u32, u32) {
        (self.z, self.y, self.x)
    }
}

impl std::fmt::Display for Dim3 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// One coordinate component: a concrete value, a wildcard matching any
/// value, or a reference to the corresponding component of the current
/// focus, resolved by [`Coords::evaluate_current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordValue<T> {
    Concrete(T),
    #[default]
    Wildcard,
    Current,
}

impl<T: Copy> CoordValue<T> {
    #[must_use]
    pub fn concrete(&self) -> Option<T> {
        match self {
            CoordValue::Concrete(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, CoordValue::Wildcard)
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        matches!(self, CoordValue::Current)
    }
}

impl<T: Copy + PartialEq> CoordValue<T> {
    /// Filter-match semantics: a wildcard matches anything, a concrete
    /// value only its equal. An unresolved `Current` matches nothing.
    #[must_use]
    pub(crate) fn admits(&self, candidate: &CoordValue<T>) -> bool {
        match (self, candidate) {
            (CoordValue::Wildcard, _) => true,
            (CoordValue::Concrete(f), CoordValue::Concrete(v)) => f == v,
            _ => false,
        }
    }
}

/// Meta-value rank used when ordering coordinates that still carry
/// wildcards: concrete values sort first, wildcards last.
fn cmp_slot<T: Copy>(
    a: &CoordValue<T>,
    b: &CoordValue<T>,
    by: impl Fn(&T, &T) -> Ordering,
) -> Ordering {
    match (a, b) {
        (CoordValue::Concrete(x), CoordValue::Concrete(y)) => by(x, y),
        (CoordValue::Concrete(_), _) => Ordering::Less,
        (_, CoordValue::Concrete(_)) => Ordering::Greater,
        (CoordValue::Current, CoordValue::Current) => Ordering::Equal,
        (CoordValue::Current, CoordValue::Wildcard) => Ordering::Less,
        (CoordValue::Wildcard, CoordValue::Current) => Ordering::Greater,
        (CoordValue::Wildcard, CoordValue::Wildcard) => Ordering::Equal,
    }
}

/// A coordinate across both hierarchies: physical (device, SM, warp, lane)
/// and logical (kernel, grid, block, thread). `valid` is maintained by the
/// mutating operations and holds once every component has resolved to a
/// concrete value; it is also the overflow signal of the increment
/// operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coords {
    pub dev: CoordValue<u32>,
    pub sm: CoordValue<u32>,
    pub wp: CoordValue<u32>,
    pub ln: CoordValue<u32>,
    pub kernel_id: CoordValue<u64>,
    pub grid_id: CoordValue<u64>,
    pub block_idx: CoordValue<Dim3>,
    pub thread_idx: CoordValue<Dim3>,
    pub valid: bool,
}

impl Coords {
    /// The match-anything filter.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::default()
    }

    /// A fully concrete coordinate naming one lane and its logical twin.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn fully_defined(
        dev: u32,
        sm: u32,
        wp: u32,
        ln: u32,
        kernel_id: u64,
        grid_id: u64,
        block_idx: Dim3,
        thread_idx: Dim3,
    ) -> Self {
        Self {
            dev: CoordValue::Concrete(dev),
            sm: CoordValue::Concrete(sm),
            wp: CoordValue::Concrete(wp),
            ln: CoordValue::Concrete(ln),
            kernel_id: CoordValue::Concrete(kernel_id),
            grid_id: CoordValue::Concrete(grid_id),
            block_idx: CoordValue::Concrete(block_idx),
            thread_idx: CoordValue::Concrete(thread_idx),
            valid: true,
        }
    }

    #[must_use]
    pub fn is_fully_defined(&self) -> bool {
        self.dev.concrete().is_some()
            && self.sm.concrete().is_some()
            && self.wp.concrete().is_some()
            && self.ln.concrete().is_some()
            && self.kernel_id.concrete().is_some()
            && self.grid_id.concrete().is_some()
            && self.block_idx.concrete().is_some()
            && self.thread_idx.concrete().is_some()
    }

    pub fn update_valid(&mut self) {
        self.valid = self.is_fully_defined();
    }

    /// Replaces every `Current` component with the corresponding component
    /// of `focus`. Without a focus, `Current` degrades to `Wildcard`, or
    /// fails when `strict`.
    pub fn evaluate_current(&mut self, focus: Option<&Coords>, strict: bool) -> Result<()> {
        let any_current = self.dev.is_current()
            || self.sm.is_current()
            || self.wp.is_current()
            || self.ln.is_current()
            || self.kernel_id.is_current()
            || self.grid_id.is_current()
            || self.block_idx.is_current()
            || self.thread_idx.is_current();
        if !any_current {
            return Ok(());
        }

        fn resolve<T: Copy>(slot: &mut CoordValue<T>, from: Option<&CoordValue<T>>) {
            if slot.is_current() {
                *slot = match from {
                    Some(f) => *f,
                    None => CoordValue::Wildcard,
                };
            }
        }

        if focus.is_none() && strict {
            return Err(Error::NoCurrentFocus);
        }

        resolve(&mut self.dev, focus.map(|f| &f.dev));
        resolve(&mut self.sm, focus.map(|f| &f.sm));
        resolve(&mut self.wp, focus.map(|f| &f.wp));
        resolve(&mut self.ln, focus.map(|f| &f.ln));
        resolve(&mut self.kernel_id, focus.map(|f| &f.kernel_id));
        resolve(&mut self.grid_id, focus.map(|f| &f.grid_id));
        resolve(&mut self.block_idx, focus.map(|f| &f.block_idx));
        resolve(&mut self.thread_idx, focus.map(|f| &f.thread_idx));
        self.update_valid();
        Ok(())
    }

    /// Fails with [`Error::Incomplete`] when a required axis group has not
    /// resolved to concrete values. With `any` set, an unresolved `Current`
    /// anywhere is also incomplete: current-evaluation must have run first.
    pub fn check_fully_defined(&self, logical: bool, physical: bool, any: bool) -> Result<()> {
        if any {
            let any_current = self.dev.is_current()
                || self.sm.is_current()
                || self.wp.is_current()
                || self.ln.is_current()
                || self.kernel_id.is_current()
                || self.grid_id.is_current()
                || self.block_idx.is_current()
                || self.thread_idx.is_current();
            if any_current {
                return Err(Error::Incomplete("current focus"));
            }
        }
        if logical
            && (self.kernel_id.concrete().is_none()
                || self.block_idx.concrete().is_none()
                || self.thread_idx.concrete().is_none())
        {
            return Err(Error::Incomplete("logical coordinates"));
        }
        if physical
            && (self.dev.concrete().is_none()
                || self.sm.concrete().is_none()
                || self.wp.concrete().is_none()
                || self.ln.concrete().is_none())
        {
            return Err(Error::Incomplete("physical coordinates"));
        }
        Ok(())
    }

    /// Does this coordinate, used as a filter, admit `candidate`?
    #[must_use]
    pub fn matches(&self, candidate: &Coords) -> bool {
        self.dev.admits(&candidate.dev)
            && self.sm.admits(&candidate.sm)
            && self.wp.admits(&candidate.wp)
            && self.ln.admits(&candidate.ln)
            && self.kernel_id.admits(&candidate.kernel_id)
            && self.grid_id.admits(&candidate.grid_id)
            && self.block_idx.admits(&candidate.block_idx)
            && self.thread_idx.admits(&candidate.thread_idx)
    }

    /// True when every concrete component equals the focus. Used to mark
    /// the `current` column of the info tables.
    #[must_use]
    pub fn is_current(&self, focus: Option<&Coords>) -> bool {
        fn check<T: Copy + PartialEq>(
            slot: &CoordValue<T>,
            focus_slot: &CoordValue<T>,
            any: &mut bool,
            all: &mut bool,
        ) {
            if let Some(v) = slot.concrete() {
                *any = true;
                *all &= focus_slot.concrete() == Some(v);
            }
        }
        let Some(focus) = focus else {
            return false;
        };
        let mut any = false;
        let mut all = true;
        check(&self.dev, &focus.dev, &mut any, &mut all);
        check(&self.sm, &focus.sm, &mut any, &mut all);
        check(&self.wp, &focus.wp, &mut any, &mut all);
        check(&self.ln, &focus.ln, &mut any, &mut all);
        check(&self.kernel_id, &focus.kernel_id, &mut any, &mut all);
        check(&self.grid_id, &focus.grid_id, &mut any, &mut all);
        check(&self.block_idx, &focus.block_idx, &mut any, &mut all);
        check(&self.thread_idx, &focus.thread_idx, &mut any, &mut all);
        any && all
    }

    /// Lexicographic order on (kernel, blockIdx.z/y/x, threadIdx.z/y/x).
    #[must_use]
    pub fn compare_logical(&self, other: &Coords) -> Ordering {
        cmp_slot(&self.kernel_id, &other.kernel_id, |a, b| a.cmp(b))
            .then_with(|| cmp_slot(&self.block_idx, &other.block_idx, |a, b| a.zyx().cmp(&b.zyx())))
            .then_with(|| {
                cmp_slot(&self.thread_idx, &other.thread_idx, |a, b| {
                    a.zyx().cmp(&b.zyx())
                })
            })
    }

    /// Physical enumeration order on (dev, sm, warp, lane).
    #[must_use]
    pub fn compare_physical(&self, other: &Coords) -> Ordering {
        cmp_slot(&self.dev, &other.dev, |a, b| a.cmp(b))
            .then_with(|| cmp_slot(&self.sm, &other.sm, |a, b| a.cmp(b)))
            .then_with(|| cmp_slot(&self.wp, &other.wp, |a, b| a.cmp(b)))
            .then_with(|| cmp_slot(&self.ln, &other.ln, |a, b| a.cmp(b)))
    }

    /// Advances the block index in logical-lexicographic order. Overflow at
    /// the final block clears `valid` instead of wrapping.
    pub fn increment_block(&mut self, grid_dim: Dim3) {
        let Some(mut b) = self.block_idx.concrete() else {
            self.valid = false;
            return;
        };
        b.x += 1;
        if b.x >= grid_dim.x {
            b.x = 0;
            b.y += 1;
        }
        if b.y >= grid_dim.y {
            b.y = 0;
            b.z += 1;
        }
        if b.z >= grid_dim.z {
            self.valid = false;
            return;
        }
        self.block_idx = CoordValue::Concrete(b);
    }

    /// Advances the thread index, carrying into the block index. Overflow
    /// at the final thread of the final block clears `valid`.
    pub fn increment_thread(&mut self, grid_dim: Dim3, block_dim: Dim3) {
        let Some(mut t) = self.thread_idx.concrete() else {
            self.valid = false;
            return;
        };
        t.x += 1;
        if t.x >= block_dim.x {
            t.x = 0;
            t.y += 1;
        }
        if t.y >= block_dim.y {
            t.y = 0;
            t.z += 1;
        }
        if t.z >= block_dim.z {
            t.z = 0;
            self.thread_idx = CoordValue::Concrete(t);
            self.increment_block(grid_dim);
            return;
        }
        self.thread_idx = CoordValue::Concrete(t);
    }
}

impl Coords {
    /// Renders only the components that resolved to concrete values, in
    /// logical-then-physical order; what the focus query prints.
    #[must_use]
    pub fn fancy_string(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.kernel_id.concrete() {
            parts.push(format!("kernel {v}"));
        }
        if let Some(v) = self.grid_id.concrete() {
            parts.push(format!("grid {v}"));
        }
        if let Some(v) = self.block_idx.concrete() {
            parts.push(format!("block {v}"));
        }
        if let Some(v) = self.thread_idx.concrete() {
            parts.push(format!("thread {v}"));
        }
        if let Some(v) = self.dev.concrete() {
            parts.push(format!("device {v}"));
        }
        if let Some(v) = self.sm.concrete() {
            parts.push(format!("sm {v}"));
        }
        if let Some(v) = self.wp.concrete() {
            parts.push(format!("warp {v}"));
        }
        if let Some(v) = self.ln.concrete() {
            parts.push(format!("lane {v}"));
        }
        parts.join(", ")
    }
}

impl std::fmt::Display for Coords {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn scalar<T: std::fmt::Display + Copy>(v: &CoordValue<T>) -> String {
            match v {
                CoordValue::Concrete(x) => x.to_string(),
                CoordValue::Wildcard => "*".to_string(),
                CoordValue::Current => "current".to_string(),
            }
        }
        write!(
            f,
            "kernel {}, grid {}, block {}, thread {}, device {}, sm {}, warp {}, lane {}",
            scalar(&self.kernel_id),
            scalar(&self.grid_id),
            scalar(&self.block_idx),
            scalar(&self.thread_idx),
            scalar(&self.dev),
            scalar(&self.sm),
            scalar(&self.wp),
            scalar(&self.ln),
        )
    }
}

/// The best live lane under each of the four selection kinds.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub exact_physical: Option<Coords>,
    pub closest_physical: Option<Coords>,
    pub exact_logical: Option<Coords>,
    pub closest_logical: Option<Coords>,
}

/// Axis priority lists for the closest-match ranking.
const PHYSICAL_PRIORITY: [Axis8; 8] = [
    Axis8::Dev,
    Axis8::Sm,
    Axis8::Wp,
    Axis8::Ln,
    Axis8::Kernel,
    Axis8::Grid,
    Axis8::Block,
    Axis8::Thread,
];
const LOGICAL_PRIORITY: [Axis8; 8] = [
    Axis8::Kernel,
    Axis8::Grid,
    Axis8::Block,
    Axis8::Thread,
    Axis8::Dev,
    Axis8::Sm,
    Axis8::Wp,
    Axis8::Ln,
];

#[derive(Clone, Copy)]
enum Axis8 {
    Dev,
    Sm,
    Wp,
    Ln,
    Kernel,
    Grid,
    Block,
    Thread,
}

fn axis_admits(request: &Coords, candidate: &Coords, axis: Axis8) -> bool {
    match axis {
        Axis8::Dev => request.dev.admits(&candidate.dev),
        Axis8::Sm => request.sm.admits(&candidate.sm),
        Axis8::Wp => request.wp.admits(&candidate.wp),
        Axis8::Ln => request.ln.admits(&candidate.ln),
        Axis8::Kernel => request.kernel_id.admits(&candidate.kernel_id),
        Axis8::Grid => request.grid_id.admits(&candidate.grid_id),
        Axis8::Block => request.block_idx.admits(&candidate.block_idx),
        Axis8::Thread => request.thread_idx.admits(&candidate.thread_idx),
    }
}

/// Length of the matching prefix of the priority list.
fn prefix_score(request: &Coords, candidate: &Coords, priority: &[Axis8; 8]) -> usize {
    priority
        .iter()
        .take_while(|axis| axis_admits(request, candidate, **axis))
        .count()
}

/// Enumerates the live lanes matching `select` and picks, for each of the
/// four selection kinds, the best candidate for `request`. `exact_*` only
/// holds a candidate matched by every concrete component of the request;
/// `closest_*` maximizes the matching prefix of the axis priority list,
/// physical axes first or logical axes first. Ties go to the earliest
/// candidate in physical respectively logical enumeration order.
pub fn find_valid<A: DebugApi>(
    sys: &mut System<A>,
    request: &Coords,
    select: Select,
) -> Result<Candidates> {
    let all = Coords::wildcard();
    let iter = CoordIterator::new(sys, Granularity::Lanes, &all, select)?;
    let physical: Vec<Coords> = iter.collect();

    let mut logical = physical.clone();
    logical.sort_by(|a, b| a.compare_logical(b).then_with(|| a.compare_physical(b)));

    let mut out = Candidates::default();
    let mut best_physical = 0;
    for c in &physical {
        if out.exact_physical.is_none() && request.matches(c) {
            out.exact_physical = Some(*c);
        }
        let score = prefix_score(request, c, &PHYSICAL_PRIORITY);
        if out.closest_physical.is_none() || score > best_physical {
            out.closest_physical = Some(*c);
            best_physical = score;
        }
    }
    let mut best_logical = 0;
    for c in &logical {
        if out.exact_logical.is_none() && request.matches(c) {
            out.exact_logical = Some(*c);
        }
        let score = prefix_score(request, c, &LOGICAL_PRIORITY);
        if out.closest_logical.is_none() || score > best_logical {
            out.closest_logical = Some(*c);
            best_logical = score;
        }
    }
    Ok(out)
}
