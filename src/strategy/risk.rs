//! Risk scoring.
//!
//! Weighted mean of three terms, each in [0, 1]:
//! - protocol risk: configured constant, averaged over both legs;
//! - position risk: `1 - min(margin / reference_margin, 1)` where margin is
//!   the supply leg's liquidation threshold minus its collateral factor;
//! - asset risk: configured constant for the riskier asset class.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::RiskWeights;
use crate::tokens;
use crate::types::UnifiedMarketData;

pub fn protocol_risk(supply: &UnifiedMarketData, borrow: &UnifiedMarketData, w: &RiskWeights) -> Decimal {
    (w.protocol_risk(&supply.protocol_name) + w.protocol_risk(&borrow.protocol_name)) / dec!(2)
}

pub fn position_risk(supply: &UnifiedMarketData, w: &RiskWeights) -> Decimal {
    let margin = (supply.liquidation_threshold - supply.collateral_factor).max(Decimal::ZERO);
    let cover = (margin / w.reference_margin).min(Decimal::ONE);
    Decimal::ONE - cover
}

pub fn asset_risk(supply: &UnifiedMarketData, borrow: &UnifiedMarketData, w: &RiskWeights) -> Decimal {
    let a = w.asset_class_risk(tokens::classify_asset(&supply.asset_symbol));
    let b = w.asset_class_risk(tokens::classify_asset(&borrow.asset_symbol));
    a.max(b)
}

/// Combined score, clamped to [0, 1].
pub fn risk_score(supply: &UnifiedMarketData, borrow: &UnifiedMarketData, w: &RiskWeights) -> Decimal {
    let total_weight = w.protocol_weight + w.position_weight + w.asset_weight;
    if total_weight <= Decimal::ZERO {
        return Decimal::ONE;
    }
    let weighted = w.protocol_weight * protocol_risk(supply, borrow, w)
        + w.position_weight * position_risk(supply, w)
        + w.asset_weight * asset_risk(supply, borrow, w);
    (weighted / total_weight).clamp(Decimal::ZERO, Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_market(protocol: &str, asset: &str) -> UnifiedMarketData {
        UnifiedMarketData::sample(protocol, "m", asset)
    }

    #[test]
    fn test_protocol_risk_averages_legs() {
        let w = RiskWeights::default();
        let s = make_market("aavev3", "USDC");
        let b = make_market("fluid", "USDC");
        assert_eq!(protocol_risk(&s, &b, &w), dec!(0.3));
    }

    #[test]
    fn test_unknown_protocol_uses_default() {
        let w = RiskWeights::default();
        let s = make_market("radiant", "USDC");
        assert_eq!(protocol_risk(&s, &s, &w), w.default_protocol_risk);
    }

    #[test]
    fn test_position_risk_from_margin() {
        let w = RiskWeights::default();
        let mut s = make_market("aavev3", "USDC");
        // margin 0.05 of reference 0.10
        s.collateral_factor = dec!(0.75);
        s.liquidation_threshold = dec!(0.80);
        assert_eq!(position_risk(&s, &w), dec!(0.5));

        s.liquidation_threshold = dec!(0.95);
        assert_eq!(position_risk(&s, &w), Decimal::ZERO);

        s.liquidation_threshold = dec!(0.70);
        assert_eq!(position_risk(&s, &w), Decimal::ONE);
    }

    #[test]
    fn test_asset_risk_takes_riskier_leg() {
        let w = RiskWeights::default();
        let s = make_market("aavev3", "USDC");
        let b = make_market("fluid", "WETH");
        assert_eq!(asset_risk(&s, &b, &w), dec!(0.4));
    }

    #[test]
    fn test_combined_score() {
        let w = RiskWeights::default();
        let s = make_market("aavev3", "USDC");
        let b = make_market("fluid", "USDC");
        // 0.4 * 0.3 + 0.4 * 0.5 + 0.2 * 0.2 = 0.36
        assert_eq!(risk_score(&s, &b, &w), dec!(0.36));
    }

    #[test]
    fn test_score_clamped() {
        let mut w = RiskWeights::default();
        w.protocol_risk.insert("aavev3".into(), dec!(5));
        let s = make_market("aavev3", "USDC");
        assert_eq!(risk_score(&s, &s, &w), Decimal::ONE);
    }

    #[test]
    fn test_weights_are_injected() {
        let mut w = RiskWeights::default();
        w.protocol_weight = Decimal::ZERO;
        w.asset_weight = Decimal::ZERO;
        w.position_weight = Decimal::ONE;
        let s = make_market("aavev3", "USDC");
        assert_eq!(risk_score(&s, &s, &w), position_risk(&s, &w));
    }
}
