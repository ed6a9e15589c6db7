//! Store-backed account ledger
//!
//! Owns account leaves, token balances and the account tree. Every write
//! goes through [`AccountState::commit`], which refreshes the token root
//! and leaf hash of each touched account and patches the tree nodes in
//! place, so the root never needs a full rebuild.

use crate::apply::{AccountState, Change};
use crate::error::{ZkError, ZkResult};
use crate::keys::meta;
use crate::merkle::{self, Hash, NodeStore, ZERO_HASH};
use crate::mimc::{bytes_to_fr_str, parse_decimal, str_to_fr_bytes, u64_to_fr_bytes, Mimc};
use crate::records::{AccountLeaf, TokenBalance};
use crate::store::StateStore;
use crate::types::{FEE_ACCOUNT_ID, SYSTEM_ACCOUNT_COUNT};
use num_bigint::BigUint;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Leaf data of a token: `MiMC(tokenId || balance)`.
pub fn token_hash(token: &TokenBalance) -> ZkResult<Hash> {
    let mut h = Mimc::new();
    h.write(&u64_to_fr_bytes(token.token_id));
    h.write(&str_to_fr_bytes(&token.balance)?);
    Ok(h.sum())
}

/// Root of an account's token sub-tree, decimal text.
///
/// `tokens` must be in first-touch order. A system account without tokens
/// has root `"0"`.
pub fn token_tree_root(account_id: u64, tokens: &[TokenBalance]) -> ZkResult<String> {
    if account_id < SYSTEM_ACCOUNT_COUNT && tokens.is_empty() {
        return Ok("0".to_string());
    }
    let hashes = tokens.iter().map(token_hash).collect::<ZkResult<Vec<_>>>()?;
    Ok(bytes_to_fr_str(&merkle::root(&hashes)))
}

/// Leaf data of an account.
///
/// Field order: account id, eth address, chain33 address, the four public
/// keys as (X, Y) with `(0, 0)` for an empty slot, token root.
pub fn leaf_hash(leaf: &AccountLeaf) -> ZkResult<Hash> {
    let mut h = Mimc::new();
    h.write(&u64_to_fr_bytes(leaf.account_id));
    h.write(&str_to_fr_bytes(&leaf.eth_address)?);
    h.write(&str_to_fr_bytes(&leaf.chain33_address)?);
    for key in &leaf.pub_keys {
        match key {
            Some(key) => {
                h.write(&str_to_fr_bytes(&key.x)?);
                h.write(&str_to_fr_bytes(&key.y)?);
            }
            None => {
                h.write(&ZERO_HASH);
                h.write(&ZERO_HASH);
            }
        }
    }
    h.write(&str_to_fr_bytes(&leaf.token_tree_root)?);
    Ok(h.sum())
}

/// The four reserved accounts with their token roots filled in.
///
/// Only the fee account carries addresses, and it starts holding token 0
/// with balance zero. Addresses are decimal text.
pub fn genesis_accounts(
    eth_fee_addr: &str,
    chain33_fee_addr: &str,
) -> ZkResult<Vec<(AccountLeaf, Vec<TokenBalance>)>> {
    parse_decimal(eth_fee_addr)?;
    parse_decimal(chain33_fee_addr)?;

    let mut accounts = Vec::with_capacity(SYSTEM_ACCOUNT_COUNT as usize);
    for account_id in 0..SYSTEM_ACCOUNT_COUNT {
        let (mut leaf, tokens) = if account_id == FEE_ACCOUNT_ID {
            let mut leaf = AccountLeaf::new(account_id, eth_fee_addr, chain33_fee_addr);
            leaf.token_ids.push(0);
            let tokens = vec![TokenBalance {
                token_id: 0,
                balance: "0".to_string(),
            }];
            (leaf, tokens)
        } else {
            (AccountLeaf::new(account_id, "0", "0"), Vec::new())
        };
        leaf.token_tree_root = token_tree_root(account_id, &tokens)?;
        accounts.push((leaf, tokens));
    }
    Ok(accounts)
}

/// Changes that create the reserved accounts on an empty state.
pub fn genesis_changes(eth_fee_addr: &str, chain33_fee_addr: &str) -> ZkResult<Vec<Change>> {
    let mut changes = Vec::new();
    for (leaf, tokens) in genesis_accounts(eth_fee_addr, chain33_fee_addr)? {
        changes.push(Change::CreateLeaf {
            account_id: leaf.account_id,
            eth_address: leaf.eth_address.clone(),
            chain33_address: leaf.chain33_address.clone(),
        });
        for token in tokens {
            changes.push(Change::SetBalance {
                account_id: leaf.account_id,
                token_id: token.token_id,
                balance: parse_decimal(&token.balance)?,
            });
        }
    }
    Ok(changes)
}

/// Account root right after genesis, decimal text.
///
/// Depends on the two fee addresses only.
pub fn genesis_root(eth_fee_addr: &str, chain33_fee_addr: &str) -> ZkResult<String> {
    let hashes = genesis_accounts(eth_fee_addr, chain33_fee_addr)?
        .iter()
        .map(|(leaf, _)| leaf_hash(leaf))
        .collect::<ZkResult<Vec<_>>>()?;
    Ok(bytes_to_fr_str(&merkle::root(&hashes)))
}

/// Account tree nodes kept in the `tree` column family.
struct StoreNodes<'a> {
    store: &'a dyn StateStore,
}

impl NodeStore for StoreNodes<'_> {
    fn node(&self, height: u8, index: u64) -> ZkResult<Option<Hash>> {
        Ok(self.store.get_tree_node(height, index)?)
    }

    fn set_node(&mut self, height: u8, index: u64, hash: Hash) -> ZkResult<()> {
        Ok(self.store.put_tree_node(height, index, &hash)?)
    }
}

/// Account ledger over a [`StateStore`].
pub struct Ledger<'a> {
    store: &'a dyn StateStore,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a dyn StateStore) -> Self {
        Self { store }
    }

    /// Create the reserved accounts and return the resulting root.
    pub fn init_genesis(&mut self, eth_fee_addr: &str, chain33_fee_addr: &str) -> ZkResult<String> {
        if self.account_count()? > 0 {
            return Err(ZkError::malformed("ledger already holds accounts"));
        }
        let changes = genesis_changes(eth_fee_addr, chain33_fee_addr)?;
        self.commit(changes)?;
        let root = self.root()?;
        info!("Genesis created: root={}", root);
        Ok(root)
    }

    pub fn get_leaf(&self, account_id: u64) -> ZkResult<Option<AccountLeaf>> {
        Ok(self.store.get_leaf(account_id)?)
    }

    pub fn get_token(&self, account_id: u64, token_id: u64) -> ZkResult<Option<TokenBalance>> {
        Ok(self.store.get_token(account_id, token_id)?)
    }

    /// Balances of every token the account has held, in first-touch order.
    pub fn tokens_of(&self, leaf: &AccountLeaf) -> ZkResult<Vec<TokenBalance>> {
        let mut tokens = Vec::with_capacity(leaf.token_ids.len());
        for token_id in &leaf.token_ids {
            let token = self.store.get_token(leaf.account_id, *token_id)?.ok_or_else(|| {
                ZkError::not_found(format!(
                    "token {} of account {}",
                    token_id, leaf.account_id
                ))
            })?;
            tokens.push(token);
        }
        Ok(tokens)
    }

    pub fn account_id_by_addresses(
        &self,
        chain33_address: &str,
        eth_address: &str,
    ) -> ZkResult<Option<u64>> {
        Ok(self
            .store
            .get_account_id_by_addresses(chain33_address, eth_address)?)
    }

    pub fn accounts_by_eth(&self, eth_address: &str) -> ZkResult<Vec<AccountLeaf>> {
        self.leaves_for(self.store.get_account_ids_by_eth(eth_address)?)
    }

    pub fn accounts_by_chain33(&self, chain33_address: &str) -> ZkResult<Vec<AccountLeaf>> {
        self.leaves_for(self.store.get_account_ids_by_chain33(chain33_address)?)
    }

    fn leaves_for(&self, ids: Vec<u64>) -> ZkResult<Vec<AccountLeaf>> {
        let mut leaves = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(leaf) = self.store.get_leaf(id)? {
                leaves.push(leaf);
            }
        }
        Ok(leaves)
    }

    /// Add `amount` to a balance.
    pub fn credit(&mut self, account_id: u64, token_id: u64, amount: &str) -> ZkResult<()> {
        let amount = parse_decimal(amount)?;
        self.require_account(account_id)?;
        let balance = self.balance(account_id, token_id)?.unwrap_or_default();
        self.commit(vec![Change::SetBalance {
            account_id,
            token_id,
            balance: balance + amount,
        }])
    }

    /// Subtract `amount` from a balance, failing if it would go negative.
    pub fn debit(&mut self, account_id: u64, token_id: u64, amount: &str) -> ZkResult<()> {
        let amount = parse_decimal(amount)?;
        self.require_account(account_id)?;
        let balance = self.balance(account_id, token_id)?.unwrap_or_default();
        if balance < amount {
            return Err(ZkError::InsufficientBalance {
                account_id,
                token_id,
                balance: balance.to_string(),
                delta: amount.to_string(),
            });
        }
        self.commit(vec![Change::SetBalance {
            account_id,
            token_id,
            balance: balance - amount,
        }])
    }

    fn require_account(&self, account_id: u64) -> ZkResult<()> {
        if account_id < self.account_count()? {
            Ok(())
        } else {
            Err(ZkError::not_found(format!("account {}", account_id)))
        }
    }

    pub fn root_hash(&self) -> ZkResult<Hash> {
        let nodes = StoreNodes { store: self.store };
        merkle::root_from_nodes(&nodes, self.account_count()?)
    }

    /// Current account root, decimal text.
    pub fn root(&self) -> ZkResult<String> {
        Ok(bytes_to_fr_str(&self.root_hash()?))
    }

    fn touch<'m>(
        &self,
        touched: &'m mut BTreeMap<u64, AccountLeaf>,
        account_id: u64,
    ) -> ZkResult<&'m mut AccountLeaf> {
        if !touched.contains_key(&account_id) {
            let leaf = self
                .store
                .get_leaf(account_id)?
                .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))?;
            touched.insert(account_id, leaf);
        }
        touched
            .get_mut(&account_id)
            .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))
    }
}

impl AccountState for Ledger<'_> {
    fn leaf(&self, account_id: u64) -> ZkResult<Option<AccountLeaf>> {
        self.get_leaf(account_id)
    }

    fn balance(&self, account_id: u64, token_id: u64) -> ZkResult<Option<BigUint>> {
        match self.store.get_token(account_id, token_id)? {
            Some(token) => Ok(Some(parse_decimal(&token.balance)?)),
            None => Ok(None),
        }
    }

    fn account_count(&self) -> ZkResult<u64> {
        Ok(self.store.get_counter(meta::LEAF_COUNT)?)
    }

    fn commit(&mut self, changes: Vec<Change>) -> ZkResult<()> {
        let mut count = self.account_count()?;
        let mut touched: BTreeMap<u64, AccountLeaf> = BTreeMap::new();

        for change in changes {
            match change {
                Change::CreateLeaf {
                    account_id,
                    eth_address,
                    chain33_address,
                } => {
                    let leaf = AccountLeaf::new(account_id, &eth_address, &chain33_address);
                    self.store.index_leaf_addresses(&leaf)?;
                    info!(
                        "New account {}: eth={} chain33={}",
                        account_id, eth_address, chain33_address
                    );
                    touched.insert(account_id, leaf);
                }
                Change::SetBalance {
                    account_id,
                    token_id,
                    balance,
                } => {
                    let leaf = self.touch(&mut touched, account_id)?;
                    if !leaf.token_ids.contains(&token_id) {
                        leaf.token_ids.push(token_id);
                    }
                    let token = TokenBalance {
                        token_id,
                        balance: balance.to_string(),
                    };
                    self.store.put_token(account_id, &token)?;
                    debug!("Account {} token {} balance -> {}", account_id, token_id, balance);
                }
                Change::SetPubKey {
                    account_id,
                    ty,
                    pub_key,
                } => {
                    let leaf = self.touch(&mut touched, account_id)?;
                    leaf.pub_keys[ty.slot()] = Some(pub_key);
                }
            }
        }

        // Existing leaves come first in id order, then new ones append.
        let mut nodes = StoreNodes { store: self.store };
        for (account_id, mut leaf) in touched {
            let tokens = self.tokens_of(&leaf)?;
            leaf.token_tree_root = token_tree_root(account_id, &tokens)?;
            let data = leaf_hash(&leaf)?;
            self.store.put_leaf(&leaf)?;

            if account_id < count {
                merkle::update(&mut nodes, count, account_id, &data)?;
            } else if account_id == count {
                merkle::append(&mut nodes, count, &data)?;
                count += 1;
            } else {
                return Err(ZkError::malformed(format!(
                    "account {} would leave a gap after {}",
                    account_id, count
                )));
            }
        }
        self.store.set_counter(meta::LEAF_COUNT, count)?;
        Ok(())
    }
}
