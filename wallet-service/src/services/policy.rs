//! Usage policy: limits applied before a consumption request is admitted.

use crate::models::NewConsumptionRequest;
use crate::services::error::BillingError;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct UsagePolicy {
    /// Free units granted once when a wallet is opened.
    pub free_allowance_grant: Decimal,
    pub max_units_per_request: Decimal,
    /// Lowercase file extensions accepted as sources.
    pub allowed_formats: Vec<String>,
    pub currency: String,
}

impl Default for UsagePolicy {
    fn default() -> Self {
        Self {
            free_allowance_grant: Decimal::new(10, 0),
            max_units_per_request: Decimal::new(180, 0),
            allowed_formats: ["mp3", "wav", "m4a", "ogg", "flac", "webm"]
                .iter()
                .map(|f| f.to_string())
                .collect(),
            currency: "INR".to_string(),
        }
    }
}

impl UsagePolicy {
    pub fn validate_units(&self, requested_units: Decimal) -> Result<(), BillingError> {
        if requested_units <= Decimal::ZERO {
            return Err(BillingError::InvalidRequest(
                "Duration must be greater than zero".to_string(),
            ));
        }
        if requested_units > self.max_units_per_request {
            return Err(BillingError::InvalidRequest(format!(
                "Duration exceeds the maximum of {} minutes per request",
                self.max_units_per_request.normalize()
            )));
        }
        if requested_units.round_dp(2) != requested_units {
            return Err(BillingError::InvalidRequest(
                "Duration has more than two decimal places".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_format(&self, source_format: &str) -> Result<(), BillingError> {
        let format = source_format.trim_start_matches('.').to_ascii_lowercase();
        if self.allowed_formats.iter().any(|f| *f == format) {
            Ok(())
        } else {
            Err(BillingError::InvalidRequest(format!(
                "Unsupported file format. Allowed formats: {}",
                self.allowed_formats.join(", ")
            )))
        }
    }

    pub fn validate(&self, input: &NewConsumptionRequest) -> Result<(), BillingError> {
        if input.source_handle.trim().is_empty() {
            return Err(BillingError::InvalidRequest(
                "Source file is required".to_string(),
            ));
        }
        self.validate_units(input.requested_units)?;
        self.validate_format(&input.source_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Language;

    fn input(units: &str, format: &str) -> NewConsumptionRequest {
        NewConsumptionRequest {
            source_handle: "uploads/talk.mp3".to_string(),
            source_format: format.to_string(),
            requested_units: units.parse().unwrap(),
            language: Language::Auto,
        }
    }

    #[test]
    fn test_accepts_allowed_format_case_insensitively() {
        let policy = UsagePolicy::default();
        assert!(policy.validate(&input("3.5", "MP3")).is_ok());
        assert!(policy.validate(&input("3.5", ".wav")).is_ok());
    }

    #[test]
    fn test_rejects_unknown_format() {
        let policy = UsagePolicy::default();
        assert!(matches!(
            policy.validate(&input("3.5", "exe")),
            Err(BillingError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_units() {
        let policy = UsagePolicy::default();
        assert!(policy.validate(&input("0", "mp3")).is_err());
        assert!(policy.validate(&input("-1", "mp3")).is_err());
        assert!(policy.validate(&input("180.01", "mp3")).is_err());
        assert!(policy.validate(&input("180", "mp3")).is_ok());
    }

    #[test]
    fn test_rejects_sub_hundredth_units() {
        let policy = UsagePolicy::default();
        assert!(policy.validate(&input("0.001", "mp3")).is_err());
        assert!(policy.validate(&input("15.001", "mp3")).is_err());
        assert!(policy.validate(&input("15.01", "mp3")).is_ok());
        assert!(policy.validate(&input("15.100", "mp3")).is_ok());
    }
}
