//! Grid level computation

use serde::Serialize;

use super::config::GridConfig;
use super::types::OrderSide;
use crate::errors::{Error, Result};

/// Ordered, immutable set of grid prices derived from a configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelSet {
    prices: Vec<f64>,
    interval: f64,
}

/// Direction in which the observed price moved through a level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Side of the order a crossing in this direction calls for
    pub fn order_side(&self) -> OrderSide {
        match self {
            Direction::Up => OrderSide::Sell,
            Direction::Down => OrderSide::Buy,
        }
    }
}

/// A level the price moved through between two observations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub index: usize,
    pub price: f64,
    pub direction: Direction,
}

/// Compute the grid price levels for a configuration
///
/// Returns `grid_number + 1` ascending prices. The interval is computed once
/// and every level is `lower + i * interval`, so rounding error stays bounded
/// per point instead of accumulating. The top level is pinned to the upper
/// limit.
pub fn compute_levels(config: &GridConfig) -> Result<LevelSet> {
    let lower = config.lower_limit();
    let upper = config.upper_limit();
    let grid_number = config.grid_number();

    if grid_number < 1 {
        return Err(Error::InvalidConfiguration(
            "grid_number must be at least 1".into(),
        ));
    }
    if !(upper > lower) {
        return Err(Error::InvalidConfiguration(
            "upper_limit must be greater than lower_limit".into(),
        ));
    }

    let interval = (upper - lower) / grid_number as f64;
    let prices = (0..=grid_number)
        .map(|i| {
            if i == grid_number {
                upper
            } else {
                lower + i as f64 * interval
            }
        })
        .collect();

    Ok(LevelSet { prices, interval })
}

impl LevelSet {
    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f64> {
        self.prices.get(index).copied()
    }

    /// Index of the level at `price`, tolerating float noise well below one interval
    pub fn index_of(&self, price: f64) -> Option<usize> {
        let tolerance = self.interval * 1e-9;
        self.prices
            .iter()
            .position(|&level| (level - price).abs() <= tolerance)
    }

    /// Levels crossed when the price moves from `previous` to `current`
    ///
    /// A level `L` is crossed upward when `previous < L <= current` and
    /// downward when `previous > L >= current`. Crossings are returned in the
    /// order the price passed through them.
    pub fn crossings(&self, previous: f64, current: f64) -> Vec<Crossing> {
        if current > previous {
            self.prices
                .iter()
                .enumerate()
                .filter(|&(_, &level)| previous < level && level <= current)
                .map(|(index, &price)| Crossing { index, price, direction: Direction::Up })
                .collect()
        } else if current < previous {
            self.prices
                .iter()
                .enumerate()
                .rev()
                .filter(|&(_, &level)| previous > level && level >= current)
                .map(|(index, &price)| Crossing { index, price, direction: Direction::Down })
                .collect()
        } else {
            Vec::new()
        }
    }
}
