//! Per-identity points balance (`userPoints/{identity}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::PointsError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsAccount {
    #[serde(default)]
    pub total_points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PointsAccount {
    pub fn credit(&mut self, amount: u64, now: DateTime<Utc>) {
        self.total_points = self.total_points.saturating_add(amount);
        self.last_updated = Some(now);
    }

    pub fn debit(&mut self, amount: u64, now: DateTime<Utc>) -> Result<(), PointsError> {
        self.total_points = self
            .total_points
            .checked_sub(amount)
            .ok_or(PointsError::InsufficientBalance {
                available: self.total_points,
                requested: amount,
            })?;
        self.last_updated = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debit_never_goes_negative() {
        let now = Utc::now();
        let mut account = PointsAccount::default();
        account.credit(30, now);

        let err = account.debit(50, now).unwrap_err();
        assert_eq!(
            err,
            PointsError::InsufficientBalance {
                available: 30,
                requested: 50
            }
        );
        assert_eq!(account.total_points, 30);

        account.debit(30, now).unwrap();
        assert_eq!(account.total_points, 0);
    }

    #[test]
    fn missing_fields_read_as_zero() {
        let account: PointsAccount = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(account.total_points, 0);
    }
}
