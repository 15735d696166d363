use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

/// Strictly positive, finite price.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "price must be positive, got {value}"
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Notional value of `quantity` units at this price.
    pub fn notional(&self, quantity: Quantity) -> f64 {
        self.0 * quantity.value()
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly positive, finite quantity.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if value <= 0.0 {
            return Err(ValidationError::InvalidQuantity(format!(
                "quantity must be positive, got {value}"
            )));
        }
        Ok(Quantity(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_new_valid() {
        let price = Price::new(100.0).unwrap();
        assert_eq!(price.value(), 100.0);
    }

    #[test]
    fn test_price_rejects_zero_and_negative() {
        assert!(matches!(Price::new(0.0), Err(ValidationError::InvalidPrice(_))));
        assert!(matches!(Price::new(-10.0), Err(ValidationError::InvalidPrice(_))));
    }

    #[test]
    fn test_price_rejects_nan() {
        assert_eq!(Price::new(f64::NAN), Err(ValidationError::MustBeFinite));
        assert_eq!(Price::new(f64::INFINITY), Err(ValidationError::MustBeFinite));
    }

    #[test]
    fn test_price_notional() {
        let price = Price::new(65000.0).unwrap();
        let qty = Quantity::new(0.5).unwrap();
        assert_eq!(price.notional(qty), 32500.0);
    }

    #[test]
    fn test_quantity_rejects_zero() {
        assert!(matches!(
            Quantity::new(0.0),
            Err(ValidationError::InvalidQuantity(_))
        ));
    }

    #[test]
    fn test_price_serializes_transparently() {
        let json = serde_json::to_string(&Price::new(1.5).unwrap()).unwrap();
        assert_eq!(json, "1.5");
    }
}
