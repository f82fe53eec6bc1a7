//! Pricing rule evaluation: classify stone type, walk active pricing rules
//! in ascending priority, apply the first match's margin modifier on top of
//! the feed's configured base margin.

use diamond_schemas::{PricingRule, StoneType};
use serde_json::Value;

/// Base margin ratio for a stone type, from the `BASE_MARGINS` config value
/// (e.g. `{"natural": 0.40, "lab": 0.79, "fancy": 0.40}`). Falls back to 0
/// for an unrecognized or missing key rather than failing consolidation
/// over a config typo.
pub fn base_margin(base_margins: &Value, stone_type: StoneType) -> f64 {
    base_margins.get(stone_type.as_str()).and_then(Value::as_f64).unwrap_or(0.0)
}

fn rule_matches(rule: &PricingRule, stone_type: StoneType, price: f64, feed: &str, rating: Option<i32>) -> bool {
    rule.stone_type.map(|st| st == stone_type).unwrap_or(true)
        && rule.price_min.map(|m| price >= m).unwrap_or(true)
        && rule.price_max.map(|m| price <= m).unwrap_or(true)
        && rule.feed.as_deref().map(|f| f.eq_ignore_ascii_case(feed)).unwrap_or(true)
        && rule.rating.map(|want| Some(want) == rating).unwrap_or(true)
}

/// Effective margin ratio (base + first-matching-rule modifier). `rating`
/// is the diamond's already-computed rating, since pricing rules may gate
/// on it (spec §4.4: "Walk active pricing rules ... rating (if set) match").
pub fn evaluate_margin(
    rules: &[PricingRule],
    base_margins: &Value,
    stone_type: StoneType,
    supplier_price: f64,
    feed: &str,
    rating: Option<i32>,
) -> f64 {
    let base = base_margin(base_margins, stone_type);
    let modifier = rules
        .iter()
        .find(|r| r.active && rule_matches(r, stone_type, supplier_price, feed, rating))
        .map(|r| r.margin_modifier)
        .unwrap_or(0.0);
    base + modifier
}

pub fn retail_price(supplier_price: f64, effective_margin: f64) -> f64 {
    supplier_price * (1.0 + effective_margin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn default_margins() -> Value {
        serde_json::json!({"natural": 0.40, "lab": 0.79, "fancy": 0.40})
    }

    fn rule(priority: i32, stone_type: Option<StoneType>, modifier: f64) -> PricingRule {
        PricingRule {
            id: Uuid::new_v4(),
            priority,
            stone_type,
            price_min: None,
            price_max: None,
            feed: None,
            margin_modifier: modifier,
            rating: None,
            active: true,
        }
    }

    #[test]
    fn no_matching_rule_falls_back_to_base_margin_only() {
        let margin = evaluate_margin(&[], &default_margins(), StoneType::Natural, 1000.0, "demo", None);
        assert!((margin - 0.40).abs() < 1e-9);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![rule(1, Some(StoneType::Natural), 0.05), rule(2, Some(StoneType::Natural), 0.50)];
        let margin = evaluate_margin(&rules, &default_margins(), StoneType::Natural, 1000.0, "demo", None);
        assert!((margin - 0.45).abs() < 1e-9);
    }

    #[test]
    fn retail_price_applies_effective_margin() {
        assert!((retail_price(1000.0, 0.40) - 1400.0).abs() < 1e-9);
    }

    #[test]
    fn unrecognized_base_margin_key_defaults_to_zero() {
        let empty = serde_json::json!({});
        assert_eq!(base_margin(&empty, StoneType::Fancy), 0.0);
    }
}
