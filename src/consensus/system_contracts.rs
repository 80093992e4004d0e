//! Scheduled replacement of built-in system contract code.

use crate::chain::ChainConfig;
use crate::state::{IntraBlockState, StateError};
use tracing::info;

/// Installs the contract code scheduled for block `number`, if any.
pub fn upgrade_build_in_system_contract(
    config: &ChainConfig,
    number: u64,
    ibs: &mut IntraBlockState<'_>,
) -> Result<(), StateError> {
    let Some(upgrades) = config.posa().and_then(|posa| posa.upgrades.get(&number)) else {
        return Ok(());
    };
    for upgrade in upgrades {
        info!(block = number, contract = %upgrade.address, "upgrading system contract");
        ibs.set_code(upgrade.address, upgrade.code.clone())?;
    }
    Ok(())
}
