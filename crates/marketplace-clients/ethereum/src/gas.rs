//! Fee computation for transaction attempts.
//!
//! Every retry attempt gets freshly computed settings so the nonce and the
//! network base fee are never reused across attempts. Fees escalate
//! monotonically with the attempt number: resubmitting at the same fee after
//! a transient failure risks an underpriced rejection.

/// Fee-market version of a transaction attempt. Consumers must handle both
/// variants explicitly instead of assuming field presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeSettings {
    Legacy { gas_price: u128 },
    DynamicFee { max_fee_per_gas: u128, max_priority_fee_per_gas: u128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasSettings {
    pub fee: FeeSettings,
    pub gas_limit: u64,
    pub nonce: u64,
}

/// Snapshot of the network's current fee conditions. `base_fee` is absent on
/// legacy chains and when the fee-history query fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkFees {
    pub base_fee: Option<u128>,
    pub suggested_priority_fee: u128,
    pub gas_price: u128,
}

#[derive(Debug, Clone)]
pub struct GasPolicyConfig {
    /// Floor for the priority fee (wei).
    pub min_priority_fee: u128,
    /// Starting point for the legacy flat-price fallback (wei).
    pub min_gas_price: u128,
    /// Ceiling for both the priority fee and the total fee (wei).
    pub max_gas_price: u128,
    /// Per-attempt fee multiplier, applied as `factor^attempt`.
    pub fee_increase_factor: f64,
    /// Percentage bump applied when replacing a same-nonce transaction.
    pub replacement_bump_percent: u32,
    pub gas_limit: u64,
}

impl Default for GasPolicyConfig {
    fn default() -> Self {
        Self {
            min_priority_fee: 1_500_000_000,      // 1.5 gwei
            min_gas_price: 1_000_000_000,         // 1 gwei
            max_gas_price: 500_000_000_000,       // 500 gwei
            fee_increase_factor: 1.25,
            replacement_bump_percent: 30,
            gas_limit: 500_000,
        }
    }
}

/// Computes fee parameters for a transaction attempt. Pure function of the
/// observed network state and the attempt number.
#[derive(Debug, Clone)]
pub struct GasPolicy {
    config: GasPolicyConfig,
}

impl GasPolicy {
    pub fn new(config: GasPolicyConfig) -> Self {
        Self { config }
    }

    pub fn gas_limit(&self) -> u64 {
        self.config.gas_limit
    }

    /// Settings for attempt `attempt` (0-based). With a known base fee the
    /// priority fee is the network suggestion floored at the configured
    /// minimum and escalated by `fee_increase_factor^attempt`; the max fee
    /// leaves headroom for two base-fee doublings before the next block.
    /// Without a base fee the legacy flat price scales linearly with the
    /// attempt number. Both paths are clamped to the configured ceiling.
    pub fn compute_gas_settings(&self, fees: &NetworkFees, attempt: u32, nonce: u64) -> GasSettings {
        let fee = match fees.base_fee {
            Some(base_fee) => {
                let tip = fees.suggested_priority_fee.max(self.config.min_priority_fee);
                let escalated = scale(tip, self.config.fee_increase_factor.powi(attempt as i32));
                let priority = escalated.clamp(self.config.min_priority_fee, self.config.max_gas_price);
                let max_fee =
                    base_fee.saturating_mul(2).saturating_add(priority).min(self.config.max_gas_price);
                FeeSettings::DynamicFee {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority.min(max_fee),
                }
            }
            None => {
                let gas_price = self
                    .config
                    .min_gas_price
                    .saturating_mul(u128::from(attempt) + 1)
                    .min(self.config.max_gas_price);
                FeeSettings::Legacy { gas_price }
            }
        };
        GasSettings { fee, gas_limit: self.config.gas_limit, nonce }
    }

    /// Replacement settings for a transaction rejected as underpriced: bump
    /// the previous fees by the configured percentage, keeping the nonce and
    /// gas limit. The bump is applied to the already-clamped previous fees so
    /// the replacement always beats the still-pending transaction.
    pub fn compute_replacement_gas_settings(&self, previous: &GasSettings) -> GasSettings {
        let bump = |value: u128| {
            value.saturating_mul(100 + u128::from(self.config.replacement_bump_percent)) / 100
        };
        let fee = match previous.fee {
            FeeSettings::Legacy { gas_price } => FeeSettings::Legacy { gas_price: bump(gas_price) },
            FeeSettings::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => FeeSettings::DynamicFee {
                max_fee_per_gas: bump(max_fee_per_gas),
                max_priority_fee_per_gas: bump(max_priority_fee_per_gas),
            },
        };
        GasSettings { fee, gas_limit: previous.gas_limit, nonce: previous.nonce }
    }
}

fn scale(value: u128, factor: f64) -> u128 {
    (value as f64 * factor) as u128
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> GasPolicy {
        GasPolicy::new(GasPolicyConfig::default())
    }

    fn dynamic_fees() -> NetworkFees {
        NetworkFees { base_fee: Some(20_000_000_000), suggested_priority_fee: 2_000_000_000, gas_price: 25_000_000_000 }
    }

    fn priority_fee(settings: &GasSettings) -> u128 {
        match settings.fee {
            FeeSettings::DynamicFee { max_priority_fee_per_gas, .. } => max_priority_fee_per_gas,
            FeeSettings::Legacy { gas_price } => gas_price,
        }
    }

    #[test]
    fn priority_fee_is_monotonic_over_attempts() {
        let policy = policy();
        let fees = dynamic_fees();
        let mut previous = 0u128;
        for attempt in 0..6 {
            let settings = policy.compute_gas_settings(&fees, attempt, 7);
            let priority = priority_fee(&settings);
            assert!(priority >= previous, "attempt {attempt}: {priority} < {previous}");
            previous = priority;
        }
    }

    #[test]
    fn fees_are_clamped_between_floor_and_ceiling() {
        let config = GasPolicyConfig { max_gas_price: 30_000_000_000, ..GasPolicyConfig::default() };
        let policy = GasPolicy::new(config.clone());
        let fees = dynamic_fees();
        for attempt in 0..20 {
            let settings = policy.compute_gas_settings(&fees, attempt, 0);
            match settings.fee {
                FeeSettings::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => {
                    assert!(max_priority_fee_per_gas >= config.min_priority_fee);
                    assert!(max_priority_fee_per_gas <= config.max_gas_price);
                    assert!(max_fee_per_gas <= config.max_gas_price);
                }
                FeeSettings::Legacy { .. } => panic!("expected dynamic fee settings"),
            }
        }
    }

    #[test]
    fn suggested_tip_below_floor_is_raised_to_floor() {
        let policy = policy();
        let fees = NetworkFees { base_fee: Some(10_000_000_000), suggested_priority_fee: 1, gas_price: 0 };
        let settings = policy.compute_gas_settings(&fees, 0, 0);
        assert_eq!(priority_fee(&settings), GasPolicyConfig::default().min_priority_fee);
    }

    #[test]
    fn max_fee_leaves_headroom_for_two_base_fee_doublings() {
        let policy = policy();
        let fees = dynamic_fees();
        let settings = policy.compute_gas_settings(&fees, 0, 0);
        match settings.fee {
            FeeSettings::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => {
                assert_eq!(max_fee_per_gas, 2 * 20_000_000_000 + max_priority_fee_per_gas);
            }
            FeeSettings::Legacy { .. } => panic!("expected dynamic fee settings"),
        }
    }

    #[rstest]
    #[case(0, 1_000_000_000)]
    #[case(1, 2_000_000_000)]
    #[case(4, 5_000_000_000)]
    fn legacy_fallback_scales_linearly(#[case] attempt: u32, #[case] expected: u128) {
        let policy = policy();
        let fees = NetworkFees { base_fee: None, suggested_priority_fee: 0, gas_price: 1_000_000_000 };
        let settings = policy.compute_gas_settings(&fees, attempt, 3);
        assert_eq!(settings.fee, FeeSettings::Legacy { gas_price: expected });
        assert_eq!(settings.nonce, 3);
    }

    #[test]
    fn replacement_bumps_dynamic_fees_by_at_least_thirty_percent() {
        let policy = policy();
        let previous = GasSettings {
            fee: FeeSettings::DynamicFee { max_fee_per_gas: 40_000_000_000, max_priority_fee_per_gas: 2_000_000_000 },
            gas_limit: 500_000,
            nonce: 9,
        };
        let replacement = policy.compute_replacement_gas_settings(&previous);
        match replacement.fee {
            FeeSettings::DynamicFee { max_fee_per_gas, max_priority_fee_per_gas } => {
                assert!(max_fee_per_gas * 10 >= 40_000_000_000 * 13);
                assert!(max_priority_fee_per_gas * 10 >= 2_000_000_000 * 13);
            }
            FeeSettings::Legacy { .. } => panic!("replacement changed the fee-market version"),
        }
        assert_eq!(replacement.nonce, 9);
        assert_eq!(replacement.gas_limit, 500_000);
    }

    #[test]
    fn replacement_bumps_legacy_price_and_preserves_nonce() {
        let policy = policy();
        let previous =
            GasSettings { fee: FeeSettings::Legacy { gas_price: 10_000_000_000 }, gas_limit: 21_000, nonce: 4 };
        let replacement = policy.compute_replacement_gas_settings(&previous);
        assert_eq!(replacement.fee, FeeSettings::Legacy { gas_price: 13_000_000_000 });
        assert_eq!(replacement.nonce, 4);
    }
}
