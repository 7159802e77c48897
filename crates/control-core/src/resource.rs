//! Capacity vectors
//!
//! Every admission and bin-packing decision works on a fixed four-dimensional
//! vector of {cpu, memory, network rx, network tx}. The dimension count is part
//! of the type, so a mismatch cannot be expressed.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

/// Number of tracked resource dimensions
pub const DIMENSIONS: usize = 4;

/// A single resource dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Cpu,
    Memory,
    NetRx,
    NetTx,
}

impl Resource {
    /// All dimensions in vector order
    pub const ALL: [Resource; DIMENSIONS] = [
        Resource::Cpu,
        Resource::Memory,
        Resource::NetRx,
        Resource::NetTx,
    ];
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Cpu => write!(f, "cpu"),
            Resource::Memory => write!(f, "memory"),
            Resource::NetRx => write!(f, "net_rx"),
            Resource::NetTx => write!(f, "net_tx"),
        }
    }
}

/// Immutable capacity vector, arithmetic is component-wise
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    pub cpu: f64,
    pub memory: f64,
    pub net_rx: f64,
    pub net_tx: f64,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu: 0.0,
        memory: 0.0,
        net_rx: 0.0,
        net_tx: 0.0,
    };

    pub fn new(cpu: f64, memory: f64, net_rx: f64, net_tx: f64) -> Self {
        Self {
            cpu,
            memory,
            net_rx,
            net_tx,
        }
    }

    /// Same value in every dimension
    pub fn splat(value: f64) -> Self {
        Self::new(value, value, value, value)
    }

    /// Build a vector from a per-dimension function
    pub fn from_fn(mut f: impl FnMut(Resource) -> f64) -> Self {
        Self::new(
            f(Resource::Cpu),
            f(Resource::Memory),
            f(Resource::NetRx),
            f(Resource::NetTx),
        )
    }

    pub fn get(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Cpu => self.cpu,
            Resource::Memory => self.memory,
            Resource::NetRx => self.net_rx,
            Resource::NetTx => self.net_tx,
        }
    }

    pub fn to_array(&self) -> [f64; DIMENSIONS] {
        [self.cpu, self.memory, self.net_rx, self.net_tx]
    }

    pub fn map(&self, mut f: impl FnMut(f64) -> f64) -> Self {
        Self::from_fn(|r| f(self.get(r)))
    }

    pub fn zip_with(&self, other: &Self, mut f: impl FnMut(f64, f64) -> f64) -> Self {
        Self::from_fn(|r| f(self.get(r), other.get(r)))
    }

    /// Scale every dimension by the same factor
    pub fn scale(&self, factor: f64) -> Self {
        self.map(|v| v * factor)
    }

    /// Scale each dimension by the matching factor
    pub fn scale_by(&self, factors: &Self) -> Self {
        self.zip_with(factors, |v, f| v * f)
    }

    /// Component-wise subtraction floored at zero
    pub fn saturating_sub(&self, other: &Self) -> Self {
        self.zip_with(other, |a, b| (a - b).max(0.0))
    }

    /// Clamp negative components to zero
    pub fn max_with_zero(&self) -> Self {
        self.map(|v| v.max(0.0))
    }

    /// Component-wise `<=`: true when `self` fits inside `capacity`
    pub fn fits_within(&self, capacity: &Self) -> bool {
        Resource::ALL
            .iter()
            .all(|&r| self.get(r) <= capacity.get(r))
    }

    /// True when `self >= other` in each of the given dimensions
    pub fn covers(&self, other: &Self, dimensions: &[Resource]) -> bool {
        dimensions.iter().all(|&r| self.get(r) >= other.get(r))
    }

    /// Dimensions with a strictly positive component
    pub fn positive_dimensions(&self) -> Vec<Resource> {
        Resource::ALL
            .iter()
            .copied()
            .filter(|&r| self.get(r) > 0.0)
            .collect()
    }

    pub fn is_zero(&self) -> bool {
        self.positive_dimensions().is_empty()
    }

    /// Component-wise division, dimensions with a zero divisor yield zero
    pub fn ratio(&self, total: &Self) -> Self {
        self.zip_with(total, |v, t| if t > 0.0 { v / t } else { 0.0 })
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: Self) -> Self::Output {
        self.zip_with(&rhs, |a, b| a + b)
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceVector {
    type Output = ResourceVector;

    fn sub(self, rhs: Self) -> Self::Output {
        self.zip_with(&rhs, |a, b| a - b)
    }
}

impl SubAssign for ResourceVector {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<f64> for ResourceVector {
    type Output = ResourceVector;

    fn mul(self, rhs: f64) -> Self::Output {
        self.scale(rhs)
    }
}

impl std::iter::Sum for ResourceVector {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ResourceVector::ZERO, |acc, v| acc + v)
    }
}

/// Norm used to turn a vector into a sort key
///
/// This is the single tie-break rule used wherever hosts or VMs are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortNorm {
    #[default]
    L1,
    Euclid,
    Max,
    Cpu,
}

impl SortNorm {
    pub fn apply(&self, vector: &ResourceVector) -> f64 {
        let values = vector.to_array();
        match self {
            SortNorm::L1 => values.iter().map(|v| v.abs()).sum(),
            SortNorm::Euclid => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
            SortNorm::Max => values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())),
            SortNorm::Cpu => vector.cpu,
        }
    }
}

/// Sort order applied with a norm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Increasing,
    Decreasing,
}

/// Stable sort of `items` by the norm of the vector returned by `key`
pub fn sort_by_norm<T>(
    items: &mut [T],
    norm: SortNorm,
    order: SortOrder,
    mut key: impl FnMut(&T) -> ResourceVector,
) {
    items.sort_by(|a, b| {
        let ord = norm
            .apply(&key(a))
            .partial_cmp(&norm.apply(&key(b)))
            .unwrap_or(std::cmp::Ordering::Equal);
        match order {
            SortOrder::Increasing => ord,
            SortOrder::Decreasing => ord.reverse(),
        }
    });
}
