//! Small, dependency-free building blocks shared across the crate.

pub mod codec;
pub mod dag;
pub mod dispatcher;
pub mod minmax_heap;

pub use dag::{Dag, DagError, DagNode};
pub use dispatcher::{DispatchError, Dispatcher};
pub use minmax_heap::MinMaxHeap;
