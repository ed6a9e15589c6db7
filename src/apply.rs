//! Operation application logic
//!
//! Computes the field-level effect of an [`Operation`] on account state.
//! Effects are planned against a read-only view first and handed to
//! [`AccountState::commit`] only after every check has passed, so a
//! rejected operation leaves the state untouched.
//!
//! The live ledger and history replay both go through [`apply_operation`].

use crate::error::{ZkError, ZkResult};
use crate::mimc::{self, parse_decimal, str_to_fr_bytes, u64_to_fr_bytes};
use crate::records::AccountLeaf;
use crate::types::*;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use std::collections::HashMap;
use tracing::debug;

/// One state mutation produced by planning an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    CreateLeaf {
        account_id: u64,
        eth_address: String,
        chain33_address: String,
    },
    SetBalance {
        account_id: u64,
        token_id: u64,
        balance: BigUint,
    },
    SetPubKey {
        account_id: u64,
        ty: PubKeyType,
        pub_key: PubKey,
    },
}

/// Account state an operation can be applied to.
///
/// Account ids are dense: every id below `account_count` exists.
pub trait AccountState {
    fn leaf(&self, account_id: u64) -> ZkResult<Option<AccountLeaf>>;

    fn balance(&self, account_id: u64, token_id: u64) -> ZkResult<Option<BigUint>>;

    /// Number of accounts, which is also the id of the next new account.
    fn account_count(&self) -> ZkResult<u64>;

    /// Write planned changes in order and refresh every affected root.
    fn commit(&mut self, changes: Vec<Change>) -> ZkResult<()>;
}

/// Balance recorded on the NFT account for a minted NFT.
///
/// Low 16 bytes of `MiMC(creator, serial, protocol, amount, hash_hi, hash_lo)`.
pub fn nft_record_value(
    creator_id: u64,
    serial: &BigUint,
    protocol: u64,
    amount: u64,
    content_hash: &[String; 2],
) -> ZkResult<BigUint> {
    let digest = mimc::hash(&[
        &u64_to_fr_bytes(creator_id),
        &str_to_fr_bytes(&serial.to_string())?,
        &u64_to_fr_bytes(protocol),
        &u64_to_fr_bytes(amount),
        &str_to_fr_bytes(&content_hash[0])?,
        &str_to_fr_bytes(&content_hash[1])?,
    ]);
    Ok(BigUint::from_bytes_be(&digest[16..]))
}

/// Changes accumulated for one operation, with reads served through them.
struct Plan<'a, S: AccountState + ?Sized> {
    state: &'a S,
    next_id: u64,
    balances: HashMap<(u64, u64), BigUint>,
    changes: Vec<Change>,
}

impl<'a, S: AccountState + ?Sized> Plan<'a, S> {
    fn new(state: &'a S) -> ZkResult<Self> {
        Ok(Self {
            state,
            next_id: state.account_count()?,
            balances: HashMap::new(),
            changes: Vec::new(),
        })
    }

    fn require_account(&self, account_id: u64) -> ZkResult<()> {
        if account_id < self.next_id {
            Ok(())
        } else {
            Err(ZkError::not_found(format!("account {}", account_id)))
        }
    }

    fn balance(&self, account_id: u64, token_id: u64) -> ZkResult<Option<BigUint>> {
        if let Some(balance) = self.balances.get(&(account_id, token_id)) {
            return Ok(Some(balance.clone()));
        }
        if account_id >= self.next_id {
            return Ok(None);
        }
        self.state.balance(account_id, token_id)
    }

    fn set_balance(&mut self, account_id: u64, token_id: u64, balance: BigUint) {
        self.balances.insert((account_id, token_id), balance.clone());
        self.changes.push(Change::SetBalance {
            account_id,
            token_id,
            balance,
        });
    }

    fn credit(&mut self, account_id: u64, token_id: u64, amount: &BigUint) -> ZkResult<()> {
        self.require_account(account_id)?;
        let balance = self.balance(account_id, token_id)?.unwrap_or_default();
        self.set_balance(account_id, token_id, balance + amount);
        Ok(())
    }

    fn debit(&mut self, account_id: u64, token_id: u64, amount: &BigUint) -> ZkResult<()> {
        self.require_account(account_id)?;
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.balance(account_id, token_id)?.unwrap_or_default();
        if balance < *amount {
            return Err(ZkError::InsufficientBalance {
                account_id,
                token_id,
                balance: balance.to_string(),
                delta: amount.to_string(),
            });
        }
        self.set_balance(account_id, token_id, balance - amount);
        Ok(())
    }

    /// Zero a balance that must hold exactly `expected`.
    fn drain(&mut self, account_id: u64, token_id: u64, expected: &BigUint) -> ZkResult<()> {
        self.require_account(account_id)?;
        let balance = self.balance(account_id, token_id)?.unwrap_or_default();
        if balance != *expected {
            return Err(ZkError::malformed(format!(
                "exit of account {} token {} expects balance {}, found {}",
                account_id, token_id, expected, balance
            )));
        }
        if !balance.is_zero() {
            self.set_balance(account_id, token_id, BigUint::zero());
        }
        Ok(())
    }

    fn create(&mut self, account_id: u64, eth_address: &str, chain33_address: &str) -> ZkResult<()> {
        if account_id != self.next_id {
            return Err(ZkError::malformed(format!(
                "new account id {} but next id is {}",
                account_id, self.next_id
            )));
        }
        parse_decimal(eth_address)?;
        parse_decimal(chain33_address)?;
        self.next_id += 1;
        self.changes.push(Change::CreateLeaf {
            account_id,
            eth_address: eth_address.to_string(),
            chain33_address: chain33_address.to_string(),
        });
        Ok(())
    }

    fn take_counter(&mut self, account_id: u64, first: u64) -> ZkResult<BigUint> {
        let current = self
            .balance(account_id, SYSTEM_NFT_TOKEN_ID)?
            .unwrap_or_else(|| BigUint::from(first));
        self.set_balance(account_id, SYSTEM_NFT_TOKEN_ID, &current + 1u32);
        Ok(current)
    }
}

fn amount_plus_fee(amount: &str, fee: &str) -> ZkResult<(BigUint, BigUint)> {
    let amount = parse_decimal(amount)?;
    let fee = parse_decimal(fee)?;
    Ok((&amount + &fee, amount))
}

fn plan_operation<S: AccountState + ?Sized>(state: &S, op: &Operation) -> ZkResult<Vec<Change>> {
    let mut plan = Plan::new(state)?;
    match op {
        Operation::Noop => {}
        Operation::Deposit(op) => {
            let amount = parse_decimal(&op.amount)?;
            if op.account_id >= plan.next_id {
                plan.create(op.account_id, &op.eth_address, &op.layer2_address)?;
            }
            plan.credit(op.account_id, op.token_id, &amount)?;
        }
        Operation::Withdraw(op) => {
            let (total, _) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.debit(op.account_id, op.token_id, &total)?;
        }
        Operation::Transfer(op) => {
            let (total, amount) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.require_account(op.to_account_id)?;
            plan.debit(op.from_account_id, op.token_id, &total)?;
            plan.credit(op.to_account_id, op.token_id, &amount)?;
        }
        Operation::TransferToNew(op) => {
            let (total, amount) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.debit(op.from_account_id, op.token_id, &total)?;
            plan.create(op.to_account_id, &op.eth_address, &op.layer2_address)?;
            plan.credit(op.to_account_id, op.token_id, &amount)?;
        }
        Operation::ProxyExit(op) => {
            plan.debit(op.proxy_id, op.token_id, &parse_decimal(&op.fee)?)?;
            plan.drain(op.target_id, op.token_id, &parse_decimal(&op.amount)?)?;
        }
        Operation::SetPubKey(op) => {
            let ty = PubKeyType::from_u64(op.pub_key_type).ok_or_else(|| {
                ZkError::malformed(format!("unknown pub key type {}", op.pub_key_type))
            })?;
            plan.require_account(op.account_id)?;
            parse_decimal(&op.pub_key.x)?;
            parse_decimal(&op.pub_key.y)?;
            plan.changes.push(Change::SetPubKey {
                account_id: op.account_id,
                ty,
                pub_key: op.pub_key.clone(),
            });
        }
        Operation::FullExit(op) => {
            // The whole balance leaves: the exit amount plus its fee.
            let (total, _) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.drain(op.account_id, op.token_id, &total)?;
        }
        Operation::Swap(op) => {
            let left_deal = parse_decimal(&op.left_deal_amount)?;
            let right_deal = parse_decimal(&op.right_deal_amount)?;
            let fee = parse_decimal(&op.fee)?;
            plan.require_account(op.right_account_id)?;
            plan.debit(op.left_account_id, op.left_token_id, &left_deal)?;
            plan.credit(op.right_account_id, op.left_token_id, &left_deal)?;
            plan.debit(op.right_account_id, op.right_token_id, &right_deal)?;
            plan.credit(op.left_account_id, op.right_token_id, &right_deal)?;
            plan.debit(op.left_account_id, op.left_token_id, &fee)?;
        }
        Operation::ContractToTree(op) => {
            let (total, amount) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.require_account(op.account_id)?;
            plan.debit(BRIDGE_ACCOUNT_ID, op.token_id, &total)?;
            plan.credit(op.account_id, op.token_id, &amount)?;
        }
        Operation::ContractToTreeNew(op) => {
            let (total, amount) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.debit(BRIDGE_ACCOUNT_ID, op.token_id, &total)?;
            plan.create(op.to_account_id, &op.eth_address, &op.layer2_address)?;
            plan.credit(op.to_account_id, op.token_id, &amount)?;
        }
        Operation::TreeToContract(op) => {
            let (total, amount) = amount_plus_fee(&op.amount, &op.fee)?;
            plan.debit(op.account_id, op.token_id, &total)?;
            plan.credit(BRIDGE_ACCOUNT_ID, op.token_id, &amount)?;
        }
        Operation::Fee(op) => {
            if op.account_id != FEE_ACCOUNT_ID {
                return Err(ZkError::malformed(format!(
                    "fee credited to account {}, expected {}",
                    op.account_id, FEE_ACCOUNT_ID
                )));
            }
            plan.credit(op.account_id, op.token_id, &parse_decimal(&op.amount)?)?;
        }
        Operation::MintNft(op) => {
            plan.require_account(op.recipient_id)?;
            plan.debit(op.mint_account_id, op.fee_token_id, &parse_decimal(&op.fee)?)?;

            let serial = plan.take_counter(op.mint_account_id, 0)?;
            let next_nft = plan.take_counter(NFT_ACCOUNT_ID, FIRST_NFT_TOKEN_ID)?;
            let nft_token_id = next_nft
                .to_u64()
                .ok_or_else(|| ZkError::malformed(format!("nft id {} overflows", next_nft)))?;
            if plan.balance(NFT_ACCOUNT_ID, nft_token_id)?.is_some() {
                return Err(ZkError::malformed(format!("nft {} already minted", nft_token_id)));
            }
            let record = nft_record_value(
                op.mint_account_id,
                &serial,
                op.protocol,
                op.amount,
                &op.content_hash,
            )?;
            plan.set_balance(NFT_ACCOUNT_ID, nft_token_id, record);
            plan.credit(op.recipient_id, nft_token_id, &BigUint::from(op.amount))?;
        }
        Operation::WithdrawNft(op) => {
            let recorded = plan
                .balance(NFT_ACCOUNT_ID, op.nft_token_id)?
                .ok_or_else(|| ZkError::not_found(format!("nft {}", op.nft_token_id)))?;
            let expected = nft_record_value(
                op.creator_account_id,
                &BigUint::from(op.creator_serial_id),
                op.protocol,
                op.init_mint_amount,
                &op.content_hash,
            )?;
            if recorded != expected {
                return Err(ZkError::malformed(format!(
                    "nft {} record does not match creator {} serial {}",
                    op.nft_token_id, op.creator_account_id, op.creator_serial_id
                )));
            }
            plan.debit(op.from_account_id, op.nft_token_id, &BigUint::from(op.withdraw_amount))?;
            plan.debit(op.from_account_id, op.fee_token_id, &parse_decimal(&op.fee)?)?;
        }
        Operation::TransferNft(op) => {
            let amount = BigUint::from(op.amount);
            plan.require_account(op.recipient_id)?;
            plan.debit(op.from_account_id, op.nft_token_id, &amount)?;
            plan.credit(op.recipient_id, op.nft_token_id, &amount)?;
            plan.debit(op.from_account_id, op.fee_token_id, &parse_decimal(&op.fee)?)?;
        }
    }
    Ok(plan.changes)
}

/// Apply one operation, all or nothing.
pub fn apply_operation<S: AccountState + ?Sized>(state: &mut S, op: &Operation) -> ZkResult<()> {
    let changes = plan_operation(&*state, op)?;
    debug!("{:?}: {} changes", op.kind(), changes.len());
    state.commit(changes)
}
