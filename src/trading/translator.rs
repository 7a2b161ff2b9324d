//! Order translation: master fill + copy ratio -> follower order request.

use rust_decimal::Decimal;

use crate::models::{client_order_id, MasterEvent, OrderRequest, OrderType, SkipReason, SymbolRules};

/// Result of translating one master event for one follower.
#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Order(OrderRequest),
    Skip {
        reason: SkipReason,
        /// Rounded quantity that was rejected
        quantity: Decimal,
    },
}

/// Round `value` down to a multiple of `step`.
///
/// The result carries the step's scale, so 0.25 with step 0.001 is 0.250.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Build the follower order for `event`.
///
/// Quantity is `event.quantity * copy_ratio` floored to the quantity step and
/// the price is floored to the tick. With `force_market` the replica is a
/// market order regardless of the master's order type.
pub fn translate(
    event: &MasterEvent,
    follower_id: &str,
    copy_ratio: Decimal,
    rules: &SymbolRules,
    force_market: bool,
) -> Translation {
    let quantity = floor_to_step(event.quantity * copy_ratio, rules.quantity_step);
    let price = floor_to_step(event.price, rules.price_tick);

    if quantity <= Decimal::ZERO {
        return Translation::Skip {
            reason: SkipReason::ZeroQuantity,
            quantity,
        };
    }

    if quantity < rules.min_quantity {
        return Translation::Skip {
            reason: SkipReason::BelowMinQuantity,
            quantity,
        };
    }

    if quantity * price < rules.min_notional {
        return Translation::Skip {
            reason: SkipReason::BelowMinNotional,
            quantity,
        };
    }

    let order_type = if force_market {
        OrderType::Market
    } else {
        event.order_type
    };

    Translation::Order(OrderRequest {
        symbol: event.symbol.clone(),
        side: event.side,
        order_type,
        quantity,
        price,
        position_side: event.position_side,
        reduce_only: event.reduce_only,
        client_order_id: client_order_id(&event.event_id, follower_id),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionSide, Side};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn btc_rules() -> SymbolRules {
        SymbolRules {
            quantity_step: dec!(0.001),
            price_tick: dec!(0.1),
            min_notional: dec!(100),
            min_quantity: dec!(0.001),
        }
    }

    fn fill(quantity: Decimal, price: Decimal) -> MasterEvent {
        MasterEvent {
            event_id: "8886774-42".into(),
            order_id: "8886774".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            quantity,
            price,
            order_type: OrderType::Limit,
            position_side: PositionSide::Long,
            reduce_only: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_quantity_scaled_and_floored() {
        let event = fill(dec!(1.0), dec!(50000));
        match translate(&event, "a", dec!(0.25), &btc_rules(), true) {
            Translation::Order(order) => {
                assert_eq!(order.quantity, dec!(0.250));
                assert_eq!(order.quantity.to_string(), "0.250");
                assert_eq!(order.order_type, OrderType::Market);
                assert_eq!(order.position_side, PositionSide::Long);
                assert_eq!(order.client_order_id, client_order_id("8886774-42", "a"));
            }
            other => panic!("expected order, got {:?}", other),
        }
    }

    #[test]
    fn test_rounding_is_always_down() {
        let event = fill(dec!(0.0999), dec!(50000.19));
        match translate(&event, "a", dec!(1), &btc_rules(), false) {
            Translation::Order(order) => {
                assert_eq!(order.quantity, dec!(0.099));
                assert_eq!(order.price, dec!(50000.1));
                assert_eq!(order.order_type, OrderType::Limit);
            }
            other => panic!("expected order, got {:?}", other),
        }
    }

    #[test]
    fn test_below_min_notional_is_skipped() {
        // 0.01 * 0.1 = 0.001 BTC @ 50000 = 50 USDT < 100
        let event = fill(dec!(0.01), dec!(50000));
        assert_eq!(
            translate(&event, "a", dec!(0.1), &btc_rules(), true),
            Translation::Skip {
                reason: SkipReason::BelowMinNotional,
                quantity: dec!(0.001),
            }
        );
    }

    #[test]
    fn test_zero_and_min_quantity_skips() {
        let event = fill(dec!(0.001), dec!(50000));
        assert!(matches!(
            translate(&event, "a", dec!(0.5), &btc_rules(), true),
            Translation::Skip {
                reason: SkipReason::ZeroQuantity,
                ..
            }
        ));

        let rules = SymbolRules {
            min_quantity: dec!(0.01),
            min_notional: Decimal::ZERO,
            ..btc_rules()
        };
        assert!(matches!(
            translate(&event, "a", dec!(5), &rules, true),
            Translation::Skip {
                reason: SkipReason::BelowMinQuantity,
                ..
            }
        ));
    }

    #[test]
    fn test_translation_is_deterministic() {
        let event = fill(dec!(1.2345), dec!(61234.56));
        let a = translate(&event, "f1", dec!(0.37), &btc_rules(), true);
        let b = translate(&event, "f1", dec!(0.37), &btc_rules(), true);
        assert_eq!(a, b);
    }
}
