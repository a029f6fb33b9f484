//! Distance-aware fusion of branch embeddings.
//!
//! # Components
//!
//! - [`FusionOperator`]: blends a base embedding with one or more side
//!   embeddings of the same width. Each side branch is weighted by its
//!   nominal alpha scaled down by how far it sits from the base; the base
//!   keeps the residual weight.
//!
//! ```text
//! w_i    = alpha_i * exp(-||base - side_i||^2 / dim)
//! merged = (1 - sum_i w_i) * base + sum_i w_i * side_i
//! ```

mod merge;

pub use merge::{FusionOperator, MergeOutput, DISTANCE_EPS};
