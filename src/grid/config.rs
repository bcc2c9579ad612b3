//! Grid trading configuration

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Grid configuration
///
/// Always valid once constructed: [`GridConfig::new`] and deserialization both
/// run [`GridConfig::validate`], and an invalid configuration is rejected
/// rather than clamped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGridConfig")]
pub struct GridConfig {
    /// Lower price boundary for the grid
    lower_limit: f64,
    /// Upper price boundary for the grid
    upper_limit: f64,
    /// Number of grid intervals (creates grid_number + 1 price points)
    grid_number: u32,
    /// Total investment, split evenly across grid intervals
    initial_investment: f64,
    /// Price at or below which the run halts
    stop_loss: f64,
    /// Price at or above which the run halts
    take_profit: f64,
}

#[derive(Deserialize)]
struct RawGridConfig {
    lower_limit: f64,
    upper_limit: f64,
    grid_number: u32,
    #[serde(default)]
    initial_investment: f64,
    stop_loss: f64,
    take_profit: f64,
}

impl TryFrom<RawGridConfig> for GridConfig {
    type Error = Error;

    fn try_from(raw: RawGridConfig) -> Result<Self> {
        GridConfig::new(
            raw.lower_limit,
            raw.upper_limit,
            raw.grid_number,
            raw.initial_investment,
            raw.stop_loss,
            raw.take_profit,
        )
    }
}

impl GridConfig {
    /// Create a validated grid configuration
    ///
    /// # Arguments
    /// * `lower_limit` - Lower price boundary
    /// * `upper_limit` - Upper price boundary, strictly above `lower_limit`
    /// * `grid_number` - Number of grid intervals, at least 1
    /// * `initial_investment` - Total investment, not negative
    /// * `stop_loss` - Halt price below the range
    /// * `take_profit` - Halt price above the range
    pub fn new(
        lower_limit: f64,
        upper_limit: f64,
        grid_number: u32,
        initial_investment: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<Self> {
        let config = Self {
            lower_limit,
            upper_limit,
            grid_number,
            initial_investment,
            stop_loss,
            take_profit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let prices = [
            ("lower_limit", self.lower_limit),
            ("upper_limit", self.upper_limit),
            ("initial_investment", self.initial_investment),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ];
        for (name, value) in prices {
            if !value.is_finite() {
                return Err(Error::InvalidConfiguration(format!("{name} must be finite")));
            }
        }

        if self.upper_limit <= self.lower_limit {
            return Err(Error::InvalidConfiguration(
                "upper_limit must be greater than lower_limit".into(),
            ));
        }

        if self.grid_number < 1 {
            return Err(Error::InvalidConfiguration(
                "grid_number must be at least 1".into(),
            ));
        }

        if self.initial_investment < 0.0 {
            return Err(Error::InvalidConfiguration(
                "initial_investment must not be negative".into(),
            ));
        }

        if self.stop_loss <= 0.0 || self.stop_loss >= self.lower_limit {
            return Err(Error::InvalidConfiguration(
                "stop_loss must be positive and below lower_limit".into(),
            ));
        }

        if self.take_profit <= self.upper_limit {
            return Err(Error::InvalidConfiguration(
                "take_profit must be above upper_limit".into(),
            ));
        }

        Ok(())
    }

    pub fn lower_limit(&self) -> f64 {
        self.lower_limit
    }

    pub fn upper_limit(&self) -> f64 {
        self.upper_limit
    }

    pub fn grid_number(&self) -> u32 {
        self.grid_number
    }

    pub fn initial_investment(&self) -> f64 {
        self.initial_investment
    }

    pub fn stop_loss(&self) -> f64 {
        self.stop_loss
    }

    pub fn take_profit(&self) -> f64 {
        self.take_profit
    }

    /// Order quantity placed at every level crossing
    pub fn order_quantity(&self) -> f64 {
        self.initial_investment / self.grid_number as f64
    }

    /// Calculate total number of price levels (grid_number + 1)
    pub fn num_levels(&self) -> usize {
        self.grid_number as usize + 1
    }

    /// Check if price is within the grid range
    pub fn contains(&self, price: f64) -> bool {
        price >= self.lower_limit && price <= self.upper_limit
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
