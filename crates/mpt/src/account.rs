//! The account record stored in [AccountNode](crate::AccountNode) leaves.

use alloy_primitives::{B256, U256};

/// The balance, nonce and code hash of an account.
///
/// The all-default record means "no account": setting it deletes the account
/// and its storage trie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountInfo {
    /// The number of transactions sent from this account.
    pub nonce: u64,
    /// The account balance in wei.
    pub balance: U256,
    /// The hash of the account's code; zero for accounts without code.
    pub code_hash: B256,
}

impl AccountInfo {
    /// Whether this record denotes an absent account.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash.is_zero()
    }
}
