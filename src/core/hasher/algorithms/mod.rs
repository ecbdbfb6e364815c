//! Hash method implementations.

mod average;
mod dct;
mod difference;
mod median;

pub use average::AverageHasher;
pub use dct::DctHasher;
pub use difference::DifferenceHasher;
pub use median::MedianHasher;
