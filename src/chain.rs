// =============================================================================
// Strike selection on the options chain
// =============================================================================
//
// The builder hands this module a freshly fetched chain plus the underlying
// reference price; it answers with the four contracts of the butterfly.
// The strike-grid spacing is inferred from the chain itself (modal spacing
// of adjacent listed strikes) rather than assumed.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;

use crate::error::EngineError;
use crate::types::{OptionContract, OptionKind};

/// The four contracts making up one butterfly.
#[derive(Debug, Clone)]
pub struct ButterflySelection {
    pub atm_call: OptionContract,
    pub atm_put: OptionContract,
    pub otm_call: OptionContract,
    pub otm_put: OptionContract,
    /// Inferred grid spacing used for the wing distance.
    pub grid_step: Decimal,
}

/// Modal spacing of adjacent strikes across the whole chain. Ties resolve
/// to the smaller spacing. `None` when fewer than two strikes are listed.
pub fn infer_grid_step(chain: &[OptionContract]) -> Option<Decimal> {
    let mut strikes: Vec<Decimal> = chain.iter().map(|c| c.strike).collect();
    strikes.sort_unstable();
    strikes.dedup();
    if strikes.len() < 2 {
        return None;
    }

    let mut counts: HashMap<Decimal, u32> = HashMap::new();
    for pair in strikes.windows(2) {
        let gap = pair[1] - pair[0];
        if gap > Decimal::ZERO {
            *counts.entry(gap).or_insert(0) += 1;
        }
    }

    counts
        .into_iter()
        .max_by(|(gap_a, count_a), (gap_b, count_b)| {
            count_a.cmp(count_b).then(gap_b.cmp(gap_a))
        })
        .map(|(gap, _)| gap)
}

/// Pick the ATM body and the two wings.
///
/// ATM call and put independently minimise |strike - reference| (ties go to
/// the smaller strike) and must land on the same strike K. Wings are the
/// closest contracts at least `distance` grid steps out on each side.
pub fn select_strikes(
    chain: &[OptionContract],
    reference: Decimal,
    distance: u32,
) -> Result<ButterflySelection, EngineError> {
    let grid_step = infer_grid_step(chain).ok_or_else(|| {
        EngineError::Other("options chain too sparse to infer a strike grid".to_string())
    })?;

    let atm_call = nearest_to(chain, OptionKind::Call, reference)
        .ok_or_else(|| EngineError::Other("no call contracts in chain".to_string()))?;
    let atm_put = nearest_to(chain, OptionKind::Put, reference)
        .ok_or_else(|| EngineError::Other("no put contracts in chain".to_string()))?;

    if atm_call.strike != atm_put.strike {
        return Err(EngineError::Other(format!(
            "ATM call/put strikes diverge: {} vs {} (reference {})",
            atm_call.strike, atm_put.strike, reference
        )));
    }
    let body = atm_call.strike;
    let min_width = grid_step * Decimal::from(distance);

    let otm_call = chain
        .iter()
        .filter(|c| c.kind == OptionKind::Call && c.strike > body && c.strike - body >= min_width)
        .min_by_key(|c| c.strike)
        .cloned()
        .ok_or_else(|| {
            EngineError::Other(format!(
                "no call wing at least {min_width} above {body}"
            ))
        })?;

    let otm_put = chain
        .iter()
        .filter(|c| c.kind == OptionKind::Put && c.strike < body && body - c.strike >= min_width)
        .max_by_key(|c| c.strike)
        .cloned()
        .ok_or_else(|| {
            EngineError::Other(format!(
                "no put wing at least {min_width} below {body}"
            ))
        })?;

    debug!(
        %reference,
        body = %body,
        call_wing = %otm_call.strike,
        put_wing = %otm_put.strike,
        %grid_step,
        "butterfly strikes selected"
    );

    Ok(ButterflySelection {
        atm_call,
        atm_put,
        otm_call,
        otm_put,
        grid_step,
    })
}

fn nearest_to(
    chain: &[OptionContract],
    kind: OptionKind,
    reference: Decimal,
) -> Option<OptionContract> {
    chain
        .iter()
        .filter(|c| c.kind == kind)
        .min_by(|a, b| {
            let da = (a.strike - reference).abs();
            let db = (b.strike - reference).abs();
            da.cmp(&db).then(a.strike.cmp(&b.strike))
        })
        .cloned()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn contract(kind: OptionKind, strike: Decimal) -> OptionContract {
        let suffix = match kind {
            OptionKind::Call => "C",
            OptionKind::Put => "P",
        };
        OptionContract {
            symbol: format!("BTC-260807-{strike}-{suffix}"),
            kind,
            strike,
            expiry: NaiveDate::from_ymd_opt(2026, 8, 7).unwrap(),
            tick_size: dec!(0.1),
            book: None,
        }
    }

    fn chain_with_strikes(strikes: &[Decimal]) -> Vec<OptionContract> {
        strikes
            .iter()
            .flat_map(|&s| [contract(OptionKind::Call, s), contract(OptionKind::Put, s)])
            .collect()
    }

    #[test]
    fn grid_step_is_the_modal_spacing() {
        let chain = chain_with_strikes(&[
            dec!(58000),
            dec!(59000),
            dec!(60000),
            dec!(61000),
            dec!(63000),
        ]);
        assert_eq!(infer_grid_step(&chain), Some(dec!(1000)));
    }

    #[test]
    fn grid_step_tie_prefers_smaller_spacing() {
        let chain = chain_with_strikes(&[dec!(58000), dec!(59000), dec!(61000)]);
        // One gap of 1000 and one of 2000: tie on count, smaller wins.
        assert_eq!(infer_grid_step(&chain), Some(dec!(1000)));
    }

    #[test]
    fn grid_step_needs_two_strikes() {
        let chain = chain_with_strikes(&[dec!(60000)]);
        assert_eq!(infer_grid_step(&chain), None);
        assert_eq!(infer_grid_step(&[]), None);
    }

    #[test]
    fn selects_body_and_wings_two_steps_out() {
        let chain = chain_with_strikes(&[
            dec!(56000),
            dec!(57000),
            dec!(58000),
            dec!(59000),
            dec!(60000),
            dec!(61000),
            dec!(62000),
            dec!(63000),
        ]);
        let sel = select_strikes(&chain, dec!(59850), 2).unwrap();
        assert_eq!(sel.atm_call.strike, dec!(60000));
        assert_eq!(sel.atm_put.strike, dec!(60000));
        assert_eq!(sel.otm_call.strike, dec!(62000));
        assert_eq!(sel.otm_put.strike, dec!(58000));
        assert_eq!(sel.grid_step, dec!(1000));
    }

    #[test]
    fn atm_tie_breaks_to_smaller_strike() {
        let chain = chain_with_strikes(&[dec!(59000), dec!(60000), dec!(61000), dec!(62000)]);
        let sel = select_strikes(&chain, dec!(60500), 1).unwrap();
        assert_eq!(sel.atm_call.strike, dec!(60000));
    }

    #[test]
    fn wing_skips_gaps_narrower_than_requested() {
        // Put side is missing 58000: nearest eligible put wing is 57000.
        let mut chain = chain_with_strikes(&[
            dec!(56000),
            dec!(57000),
            dec!(59000),
            dec!(60000),
            dec!(61000),
            dec!(62000),
        ]);
        chain.push(contract(OptionKind::Call, dec!(58000)));
        let sel = select_strikes(&chain, dec!(60000), 2).unwrap();
        assert_eq!(sel.otm_call.strike, dec!(62000));
        assert_eq!(sel.otm_put.strike, dec!(57000));
    }

    #[test]
    fn missing_wing_is_an_error() {
        let chain = chain_with_strikes(&[dec!(59000), dec!(60000), dec!(61000)]);
        assert!(select_strikes(&chain, dec!(60000), 2).is_err());
    }

    #[test]
    fn diverging_atm_strikes_are_an_error() {
        let mut chain: Vec<OptionContract> = vec![
            contract(OptionKind::Call, dec!(60000)),
            contract(OptionKind::Put, dec!(59000)),
        ];
        chain.extend(chain_with_strikes(&[dec!(56000), dec!(64000)]));
        assert!(select_strikes(&chain, dec!(59900), 1).is_err());
    }
}
