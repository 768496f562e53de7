use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{OrderId, OwnerId};

/// Order status lifecycle.
///
/// Closed set: anything else is rejected when read back from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Canceled => "CANCELED",
        }
    }

    /// Payment has been captured (the order reached `PAID` at some point).
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Shipped)
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "SHIPPED" => Ok(OrderStatus::Shipped),
            "CANCELED" => Ok(OrderStatus::Canceled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// One line of an order: an opaque structured record.
///
/// The pipeline never looks inside line items; it only requires them to be
/// JSON objects so they survive storage and cache round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineItem(pub serde_json::Value);

impl LineItem {
    pub fn new(value: serde_json::Value) -> DomainResult<Self> {
        if !value.is_object() {
            return Err(DomainError::validation("line item must be a JSON object"));
        }
        Ok(Self(value))
    }
}

/// Largest total the `NUMERIC(12, 2)` column holds.
pub const MAX_TOTAL_AMOUNT: Decimal = Decimal::from_parts(3_567_587_327, 232, 0, false, 2);

/// Validated input for order creation.
///
/// The store assigns `id`, `status = PENDING` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    owner_id: OwnerId,
    line_items: Vec<LineItem>,
    total_amount: Decimal,
}

impl NewOrder {
    pub fn new(
        owner_id: OwnerId,
        line_items: Vec<LineItem>,
        total_amount: Decimal,
    ) -> DomainResult<Self> {
        if total_amount <= Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "total_amount must be positive, got {total_amount}"
            )));
        }
        if total_amount.normalize().scale() > 2 {
            return Err(DomainError::validation(format!(
                "total_amount must have at most two decimal places, got {total_amount}"
            )));
        }
        if total_amount > MAX_TOTAL_AMOUNT {
            return Err(DomainError::validation(format!(
                "total_amount must not exceed {MAX_TOTAL_AMOUNT}, got {total_amount}"
            )));
        }

        Ok(Self {
            owner_id,
            line_items,
            total_amount,
        })
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    /// Materialize the record the store persists.
    pub fn into_order(self, id: OrderId, created_at: DateTime<Utc>) -> Order {
        Order {
            id,
            owner_id: self.owner_id,
            line_items: self.line_items,
            total_amount: self.total_amount,
            status: OrderStatus::Pending,
            created_at,
        }
    }
}

/// An order as persisted in the order store.
///
/// This is also the JSON snapshot kept in the cache under `order:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub owner_id: OwnerId,
    pub line_items: Vec<LineItem>,
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_owned_by(&self, owner_id: OwnerId) -> bool {
        self.owner_id == owner_id
    }

    /// Copy of this order carrying a different status.
    pub fn with_status(&self, status: OrderStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn items() -> Vec<LineItem> {
        vec![LineItem::new(json!({"sku": "A-1", "qty": 2})).unwrap()]
    }

    #[test]
    fn new_order_starts_pending() {
        let owner = OwnerId::new();
        let new = NewOrder::new(owner, items(), Decimal::new(4250, 2)).unwrap();
        let order = new.into_order(OrderId::new(), Utc::now());

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount.to_string(), "42.50");
        assert!(order.is_owned_by(owner));
    }

    #[test]
    fn zero_total_is_rejected() {
        let err = NewOrder::new(OwnerId::new(), items(), Decimal::ZERO).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn sub_cent_totals_are_rejected() {
        for (mantissa, scale) in [(1, 3), (42_505, 3), (1_999, 4)] {
            let err = NewOrder::new(OwnerId::new(), items(), Decimal::new(mantissa, scale)).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "{mantissa}e-{scale}");
        }

        // Trailing zeros beyond the second place are fine.
        let new = NewOrder::new(OwnerId::new(), items(), Decimal::new(42_500, 3)).unwrap();
        assert_eq!(new.total_amount(), Decimal::new(4250, 2));
    }

    #[test]
    fn total_must_fit_the_amount_column() {
        assert_eq!(MAX_TOTAL_AMOUNT, Decimal::new(999_999_999_999, 2));
        assert!(NewOrder::new(OwnerId::new(), items(), MAX_TOTAL_AMOUNT).is_ok());
        assert!(NewOrder::new(OwnerId::new(), items(), Decimal::new(1_000_000_000_000, 2)).is_err());
    }

    #[test]
    fn line_item_must_be_object() {
        assert!(LineItem::new(json!([1, 2])).is_err());
        assert!(LineItem::new(json!("sku")).is_err());
    }

    #[test]
    fn status_uses_upper_case_wire_names() {
        assert_eq!(serde_json::to_value(OrderStatus::Canceled).unwrap(), json!("CANCELED"));
        assert_eq!("PAID".parse::<OrderStatus>().unwrap(), OrderStatus::Paid);
        assert!(matches!(
            "paid".parse::<OrderStatus>(),
            Err(DomainError::UnknownStatus(_))
        ));
    }

    #[test]
    fn snapshot_json_round_trips() {
        let order = NewOrder::new(OwnerId::new(), items(), Decimal::new(4250, 2))
            .unwrap()
            .into_order(OrderId::new(), Utc::now());

        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back, order);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: only strictly positive totals pass validation.
        #[test]
        fn total_validation_matches_sign(cents in -1_000_000i64..1_000_000i64) {
            let total = Decimal::new(cents, 2);
            let result = NewOrder::new(OwnerId::new(), Vec::new(), total);
            prop_assert_eq!(result.is_ok(), cents > 0);
        }
    }
}
