// Trade Rule Compliance Engine
// Validates and normalizes order drafts against the exchange's symbol filters

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::TradeRulesConfig;
use crate::core::types::OrderType;
use crate::rules::filter_cache::{RulesLookup, SymbolFilterCache};
use crate::rules::math::{ceil_to_step, clamp_price, clamp_quantity, floor_to_tick};
use crate::rules::types::{
    ComplianceFailure, ComplianceResult, LotSizeFilter, OrderDraft, PriceCheck, PriceField,
    SymbolTradingRules, TradeRulesBehaviour,
};

pub struct TradeRuleComplianceEngine {
    cache: Arc<SymbolFilterCache>,
    behaviour: TradeRulesBehaviour,
}

impl TradeRuleComplianceEngine {
    pub fn new(cache: Arc<SymbolFilterCache>, behaviour: TradeRulesBehaviour) -> Self {
        Self { cache, behaviour }
    }

    pub fn from_config(cache: Arc<SymbolFilterCache>, config: &TradeRulesConfig) -> Self {
        Self::new(cache, config.behaviour)
    }

    pub fn behaviour(&self) -> TradeRulesBehaviour {
        self.behaviour
    }

    pub fn cache(&self) -> &Arc<SymbolFilterCache> {
        &self.cache
    }

    /// Check `draft` for `symbol`. Failures come back inside the result, never as `Err`.
    pub async fn validate(&self, symbol: &str, draft: &OrderDraft) -> ComplianceResult {
        if self.behaviour == TradeRulesBehaviour::None {
            return ComplianceResult::passed(draft.quantity, draft.price, draft.stop_price);
        }

        let rules = match self.cache.rules_for(symbol).await {
            RulesLookup::Found(rules) => rules,
            RulesLookup::UnknownSymbol => {
                return ComplianceResult::failed(ComplianceFailure::FilterUnavailable {
                    symbol: symbol.to_string(),
                    reason: "symbol not found".to_string(),
                })
            }
            RulesLookup::Unavailable(reason) => {
                return ComplianceResult::failed(ComplianceFailure::FilterUnavailable {
                    symbol: symbol.to_string(),
                    reason,
                })
            }
        };

        let result = check_rules(&rules, draft, self.behaviour);
        match &result.failure {
            Some(failure) => debug!(symbol = symbol, reason = %failure, "Order draft rejected"),
            None => debug!(symbol = symbol, "Order draft passed trade rules"),
        }
        result
    }
}

/// Lot size in force for `order_type`: market orders take the market filter,
/// whose zero max/step fall back to the general filter.
pub fn effective_lot_size(rules: &SymbolTradingRules, order_type: OrderType) -> Option<LotSizeFilter> {
    match (order_type, rules.market_lot_size, rules.lot_size) {
        (OrderType::Market, Some(market), general) => {
            let inherit = general.unwrap_or(LotSizeFilter {
                min_quantity: Decimal::ZERO,
                max_quantity: Decimal::ZERO,
                step_size: Decimal::ZERO,
            });
            Some(LotSizeFilter {
                min_quantity: market.min_quantity,
                max_quantity: if market.max_quantity.is_zero() {
                    inherit.max_quantity
                } else {
                    market.max_quantity
                },
                step_size: if market.step_size.is_zero() {
                    inherit.step_size
                } else {
                    market.step_size
                },
            })
        }
        (_, _, general) => general,
    }
}

/// Run the filter chain against already-resolved rules
pub fn check_rules(
    rules: &SymbolTradingRules,
    draft: &OrderDraft,
    behaviour: TradeRulesBehaviour,
) -> ComplianceResult {
    if behaviour == TradeRulesBehaviour::None {
        return ComplianceResult::passed(draft.quantity, draft.price, draft.stop_price);
    }
    let strict = behaviour == TradeRulesBehaviour::ThrowError;

    if !rules.allows(draft.order_type) {
        return ComplianceResult::failed(ComplianceFailure::OrderTypeNotAllowed {
            symbol: rules.symbol.clone(),
            order_type: draft.order_type,
        });
    }

    // Lot size
    let lot_size = effective_lot_size(rules, draft.order_type);
    let mut quantity = draft.quantity;
    if let (Some(lot), Some(original)) = (lot_size, draft.quantity) {
        let clamped = clamp_quantity(lot.min_quantity, lot.max_quantity, lot.step_size, original);
        if clamped != original {
            if strict {
                return ComplianceResult::failed(ComplianceFailure::LotSizeViolation {
                    original,
                    closest: clamped,
                });
            }
            info!(symbol = %rules.symbol, from = %original, to = %clamped, "Quantity clamped by lot size filter");
            quantity = Some(clamped);
        }
    }

    let Some(original_price) = draft.price else {
        return ComplianceResult::passed(quantity, None, draft.stop_price);
    };
    let mut price = original_price;
    let mut stop_price = draft.stop_price;

    if let Some(filter) = rules.price_filter {
        // Range: price and stop price each against the raw bounds
        if !filter.min_price.is_zero() && !filter.max_price.is_zero() {
            let clamped = clamp_price(filter.min_price, filter.max_price, price);
            if clamped != price {
                if strict {
                    return price_failure(PriceField::Price, PriceCheck::Range, price, clamped);
                }
                info!(symbol = %rules.symbol, from = %price, to = %clamped, "Price clamped by price filter");
                price = clamped;
            }

            if let Some(stop) = stop_price {
                let clamped = clamp_price(filter.min_price, filter.max_price, stop);
                if clamped != stop {
                    if strict {
                        return price_failure(PriceField::StopPrice, PriceCheck::Range, stop, clamped);
                    }
                    info!(symbol = %rules.symbol, from = %stop, to = %clamped, "Stop price clamped by price filter");
                    stop_price = Some(clamped);
                }
            }
        }

        // Tick
        if !filter.tick_size.is_zero() {
            let floored = floor_to_tick(filter.tick_size, price);
            if floored != price {
                if strict {
                    return price_failure(PriceField::Price, PriceCheck::Tick, price, floored);
                }
                info!(symbol = %rules.symbol, from = %price, to = %floored, "Price floored to tick size");
                price = floored;
            }

            if let Some(stop) = stop_price {
                let floored = floor_to_tick(filter.tick_size, stop);
                if floored != stop {
                    if strict {
                        return price_failure(PriceField::StopPrice, PriceCheck::Tick, stop, floored);
                    }
                    info!(symbol = %rules.symbol, from = %stop, to = %floored, "Stop price floored to tick size");
                    stop_price = Some(floored);
                }
            }
        }
    }

    // Min notional
    let (Some(min_notional), Some(current_quantity)) = (rules.min_notional, quantity) else {
        return ComplianceResult::passed(quantity, Some(price), stop_price);
    };
    let min_notional = min_notional.min_notional;
    let notional = match current_quantity.checked_mul(price) {
        Some(notional) => notional,
        None => {
            return ComplianceResult::failed(ComplianceFailure::MinNotionalUnresolvable {
                notional: Decimal::MAX,
                min_notional,
                reason: "order size overflows".to_string(),
            })
        }
    };
    if notional >= min_notional {
        return ComplianceResult::passed(quantity, Some(price), stop_price);
    }

    if strict {
        return ComplianceResult::failed(ComplianceFailure::MinNotionalViolation { notional, min_notional });
    }

    let Some(lot) = lot_size else {
        return ComplianceResult::failed(ComplianceFailure::MinNotionalUnresolvable {
            notional,
            min_notional,
            reason: "LotSize filter not present".to_string(),
        });
    };

    let Some(required) = min_notional.checked_div(price) else {
        return ComplianceResult::failed(ComplianceFailure::MinNotionalUnresolvable {
            notional,
            min_notional,
            reason: format!("cannot derive quantity at price {}", price),
        });
    };
    let raised = ceil_to_step(lot.min_quantity, lot.step_size, required);
    if !lot.max_quantity.is_zero() && raised > lot.max_quantity {
        return ComplianceResult::failed(ComplianceFailure::MinNotionalUnresolvable {
            notional,
            min_notional,
            reason: format!(
                "required quantity {} exceeds max quantity {}",
                raised, lot.max_quantity
            ),
        });
    }

    info!(
        symbol = %rules.symbol,
        from = %current_quantity,
        to = %raised,
        "Quantity raised to meet min notional"
    );
    ComplianceResult::passed(Some(raised), Some(price), stop_price)
}

fn price_failure(field: PriceField, check: PriceCheck, original: Decimal, closest: Decimal) -> ComplianceResult {
    ComplianceResult::failed(ComplianceFailure::PriceFilterViolation {
        field,
        check,
        original,
        closest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::{MinNotionalFilter, PriceFilter};
    use rust_decimal_macros::dec;

    fn rules() -> SymbolTradingRules {
        let mut rules = SymbolTradingRules::new("BTC_TRY");
        rules.allowed_order_types = OrderType::ALL.iter().copied().collect();
        rules.lot_size = Some(LotSizeFilter {
            min_quantity: dec!(0.001),
            max_quantity: dec!(100),
            step_size: dec!(0.001),
        });
        rules
    }

    fn limit(quantity: Decimal, price: Decimal) -> OrderDraft {
        OrderDraft::new(OrderType::Limit)
            .with_quantity(quantity)
            .with_price(price)
    }

    #[test]
    fn test_none_policy_passes_through() {
        let mut r = rules();
        r.allowed_order_types.clear();
        let draft = limit(dec!(0.12345), dec!(1));
        let result = check_rules(&r, &draft, TradeRulesBehaviour::None);
        assert!(result.passed);
        assert_eq!(result.quantity, Some(dec!(0.12345)));
    }

    #[test]
    fn test_order_type_not_allowed() {
        let mut r = rules();
        r.allowed_order_types.remove(&OrderType::Market);
        let draft = OrderDraft::new(OrderType::Market).with_quantity(dec!(1));
        let result = check_rules(&r, &draft, TradeRulesBehaviour::AutoClamp);
        assert!(matches!(result.failure, Some(ComplianceFailure::OrderTypeNotAllowed { .. })));
    }

    #[test]
    fn test_lot_size_auto_clamp() {
        let draft = OrderDraft::new(OrderType::Market).with_quantity(dec!(0.12345));
        let result = check_rules(&rules(), &draft, TradeRulesBehaviour::AutoClamp);
        assert!(result.passed);
        assert_eq!(result.quantity, Some(dec!(0.123)));
        assert_eq!(result.price, None);
    }

    #[test]
    fn test_lot_size_throw_error() {
        let draft = OrderDraft::new(OrderType::Market).with_quantity(dec!(0.12345));
        let result = check_rules(&rules(), &draft, TradeRulesBehaviour::ThrowError);
        assert!(!result.passed);
        assert_eq!(
            result.failure,
            Some(ComplianceFailure::LotSizeViolation {
                original: dec!(0.12345),
                closest: dec!(0.123),
            })
        );
    }

    #[test]
    fn test_market_lot_size_inherits_zero_fields() {
        let mut r = rules();
        r.market_lot_size = Some(LotSizeFilter {
            min_quantity: dec!(0.01),
            max_quantity: dec!(0),
            step_size: dec!(0),
        });
        let lot = effective_lot_size(&r, OrderType::Market).unwrap();
        assert_eq!(lot.min_quantity, dec!(0.01));
        assert_eq!(lot.max_quantity, dec!(100));
        assert_eq!(lot.step_size, dec!(0.001));

        // limit orders ignore the market filter
        assert_eq!(effective_lot_size(&r, OrderType::Limit), r.lot_size);
    }

    #[test]
    fn test_price_tick_floor() {
        let mut r = rules();
        r.price_filter = Some(PriceFilter {
            min_price: dec!(0),
            max_price: dec!(0),
            tick_size: dec!(0.01),
        });
        let result = check_rules(&r, &limit(dec!(1), dec!(101.2378)), TradeRulesBehaviour::AutoClamp);
        assert!(result.passed);
        assert_eq!(result.price, Some(dec!(101.23)));

        let strict = check_rules(&r, &limit(dec!(1), dec!(101.2378)), TradeRulesBehaviour::ThrowError);
        assert!(matches!(
            strict.failure,
            Some(ComplianceFailure::PriceFilterViolation {
                field: PriceField::Price,
                check: PriceCheck::Tick,
                ..
            })
        ));
    }

    #[test]
    fn test_stop_price_clamped_independently() {
        let mut r = rules();
        r.price_filter = Some(PriceFilter {
            min_price: dec!(10),
            max_price: dec!(1000),
            tick_size: dec!(0.5),
        });
        let draft = OrderDraft::new(OrderType::StopLossLimit)
            .with_quantity(dec!(1))
            .with_price(dec!(2000))
            .with_stop_price(dec!(5.3));
        let result = check_rules(&r, &draft, TradeRulesBehaviour::AutoClamp);
        assert!(result.passed);
        assert_eq!(result.price, Some(dec!(1000)));
        assert_eq!(result.stop_price, Some(dec!(10)));

        let draft = draft.with_price(dec!(500)).with_stop_price(dec!(20.7));
        let result = check_rules(&r, &draft, TradeRulesBehaviour::AutoClamp);
        assert_eq!(result.stop_price, Some(dec!(20.5)));

        let strict = check_rules(&r, &draft, TradeRulesBehaviour::ThrowError);
        assert!(matches!(
            strict.failure,
            Some(ComplianceFailure::PriceFilterViolation {
                field: PriceField::StopPrice,
                check: PriceCheck::Tick,
                ..
            })
        ));
    }

    #[test]
    fn test_min_notional_raises_quantity() {
        let mut r = rules();
        r.lot_size = Some(LotSizeFilter {
            min_quantity: dec!(0.01),
            max_quantity: dec!(1000),
            step_size: dec!(0.01),
        });
        r.min_notional = Some(MinNotionalFilter { min_notional: dec!(10) });

        let result = check_rules(&r, &limit(dec!(4), dec!(2)), TradeRulesBehaviour::AutoClamp);
        assert!(result.passed);
        assert_eq!(result.quantity, Some(dec!(5.00)));

        let strict = check_rules(&r, &limit(dec!(4), dec!(2)), TradeRulesBehaviour::ThrowError);
        assert_eq!(
            strict.failure,
            Some(ComplianceFailure::MinNotionalViolation {
                notional: dec!(8),
                min_notional: dec!(10),
            })
        );
    }

    #[test]
    fn test_min_notional_rounds_up_to_step() {
        let mut r = rules();
        r.min_notional = Some(MinNotionalFilter { min_notional: dec!(10) });
        let result = check_rules(&r, &limit(dec!(1), dec!(3)), TradeRulesBehaviour::AutoClamp);
        assert_eq!(result.quantity, Some(dec!(3.334)));
    }

    #[test]
    fn test_min_notional_without_lot_size_fails() {
        let mut r = rules();
        r.lot_size = None;
        r.min_notional = Some(MinNotionalFilter { min_notional: dec!(10) });
        let result = check_rules(&r, &limit(dec!(1), dec!(2)), TradeRulesBehaviour::AutoClamp);
        assert!(matches!(
            result.failure,
            Some(ComplianceFailure::MinNotionalUnresolvable { .. })
        ));
    }

    #[test]
    fn test_min_notional_above_max_quantity_fails() {
        let mut r = rules();
        r.min_notional = Some(MinNotionalFilter { min_notional: dec!(1000) });
        let result = check_rules(&r, &limit(dec!(1), dec!(2)), TradeRulesBehaviour::AutoClamp);
        let reason = result.failure_reason().unwrap();
        assert!(reason.contains("exceeds max quantity"));
    }
}
