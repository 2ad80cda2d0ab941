//! Issuance schedule and monetary range checks

use crate::config::ChainParams;
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Subsidy halves every `subsidy_halving_interval` blocks.
///
/// Formula: subsidy = S₀ × 2^(-⌊h/H⌋), zero once the shift reaches 64
pub fn get_block_subsidy(height: u32, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// GetBlockValue: the most a coinbase at `height` may claim
pub fn get_block_value(height: u32, fees: Amount, params: &ChainParams) -> Amount {
    get_block_subsidy(height, params).saturating_add(fees)
}

/// MoneyRange: 0 ≤ value ≤ max money
pub fn money_range(value: Amount, params: &ChainParams) -> bool {
    (0..=params.max_money).contains(&value)
}

/// TotalSupply: sum of subsidies for heights 0..=height
pub fn total_supply(height: u32, params: &ChainParams) -> Amount {
    let interval = params.subsidy_halving_interval as u64;
    let blocks = height as u64 + 1;
    let mut total: Amount = 0;
    let mut era = 0u64;
    while era < 64 && era * interval < blocks {
        let in_era = (blocks - era * interval).min(interval);
        total = total.saturating_add((params.initial_subsidy >> era).saturating_mul(in_era as i64));
        era += 1;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    #[test]
    fn test_get_block_subsidy_genesis() {
        let params = ChainParams::main();
        assert_eq!(get_block_subsidy(0, &params), 50 * COIN);
    }

    #[test]
    fn test_get_block_subsidy_halvings() {
        let params = ChainParams::main();
        let h = params.subsidy_halving_interval;
        assert_eq!(get_block_subsidy(h - 1, &params), 50 * COIN);
        assert_eq!(get_block_subsidy(h, &params), 25 * COIN);
        assert_eq!(get_block_subsidy(2 * h, &params), 25 * COIN / 2);
    }

    #[test]
    fn test_get_block_subsidy_after_64_halvings() {
        let params = ChainParams::regtest();
        assert_eq!(get_block_subsidy(params.subsidy_halving_interval * 64, &params), 0);
    }

    #[test]
    fn test_block_value_adds_fees() {
        let params = ChainParams::main();
        assert_eq!(get_block_value(1, 1234, &params), 50 * COIN + 1234);
    }

    #[test]
    fn test_money_range() {
        let params = ChainParams::main();
        assert!(money_range(0, &params));
        assert!(money_range(params.max_money, &params));
        assert!(!money_range(-1, &params));
        assert!(!money_range(params.max_money + 1, &params));
    }

    #[test]
    fn test_total_supply_bounded_by_max_money() {
        let params = ChainParams::main();
        assert_eq!(total_supply(0, &params), 50 * COIN);
        let far = params.subsidy_halving_interval * 40;
        assert!(total_supply(far, &params) <= params.max_money);
    }
}
