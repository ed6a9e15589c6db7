//! Inbound action execution
//!
//! Turns host-chain payloads into ledger operations. Every executed
//! operation is applied to the [`Ledger`] and appended to the queue; an
//! operation paying a non-zero fee is followed by a `Fee` operation that
//! credits the fee account. Both encodings are checked against their
//! field widths before anything is applied.
//!
//! A payload without an explicit fee pays the manager-set fee for its
//! action and fee token (zero when none was set). Each action runs inside
//! one store write batch, so a failure leaves nothing behind.

use crate::apply::{apply_operation, AccountState};
use crate::codec::{check_pack_value, encode_operation, rescale_decimal};
use crate::config::ZkConfig;
use crate::error::{ZkError, ZkResult};
use crate::keys::meta;
use crate::ledger::Ledger;
use crate::mimc::{hex_to_decimal, parse_decimal};
use crate::proof_chain::{CommitProof, ProofChain, SubmitOutcome, Verifier};
use crate::queue::OperationQueue;
use crate::records::AccountLeaf;
use crate::store::StateStore;
use crate::types::*;
use num_bigint::BigUint;
use num_traits::Zero;
use tracing::info;

/// Decimal precision of balances inside the tree.
pub const TREE_DECIMAL: u32 = 18;

/// ERC-1155 style NFT, any amount.
pub const NFT_PROTOCOL_ERC1155: u64 = 1;
/// ERC-721 style NFT, amount is always one.
pub const NFT_PROTOCOL_ERC721: u64 = 2;

#[derive(Debug, Clone)]
pub struct Deposit {
    pub token_id: u64,
    pub amount: String,
    /// Hex host-chain address.
    pub eth_address: String,
    /// Hex layer-2 address.
    pub chain33_address: String,
    pub priority_id: u64,
}

#[derive(Debug, Clone)]
pub struct Withdraw {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    /// Falls back to the manager-set fee when `None`.
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub from_account_id: u64,
    pub to_account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferToNew {
    pub from_account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub to_eth_address: String,
    pub to_chain33_address: String,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyExit {
    pub proxy_id: u64,
    pub target_id: u64,
    pub token_id: u64,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SetPubKey {
    pub account_id: u64,
    pub pub_key_type: u64,
    pub pub_key: PubKey,
}

#[derive(Debug, Clone)]
pub struct FullExit {
    pub account_id: u64,
    pub token_id: u64,
    pub priority_id: u64,
    pub fee: Option<String>,
}

/// Host contract balance moved into the tree.
///
/// `amount` is in host precision; the receiver is either an account id or
/// an address pair, which opens a new account when unknown.
#[derive(Debug, Clone)]
pub struct ContractToTree {
    pub to_account_id: Option<u64>,
    pub to_eth_address: String,
    pub to_chain33_address: String,
    pub token_id: u64,
    pub amount: String,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TreeToContract {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MintNft {
    pub from_account_id: u64,
    pub recipient_id: u64,
    pub protocol: u64,
    pub amount: u64,
    /// 32-byte hex content hash.
    pub content_hash: String,
    pub fee_token_id: u64,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WithdrawNft {
    pub from_account_id: u64,
    pub nft_token_id: u64,
    pub amount: u64,
    pub creator_account_id: u64,
    pub creator_serial_id: u64,
    pub protocol: u64,
    pub init_mint_amount: u64,
    pub content_hash: String,
    pub fee_token_id: u64,
    pub fee: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferNft {
    pub from_account_id: u64,
    pub recipient_id: u64,
    pub nft_token_id: u64,
    pub amount: u64,
    pub fee_token_id: u64,
    pub fee: Option<String>,
}

/// Default fee for `action` when paid in `token_id`.
#[derive(Debug, Clone)]
pub struct SetFee {
    pub action: OpKind,
    pub token_id: u64,
    pub fee: String,
}

/// One inbound payload.
#[derive(Debug, Clone)]
pub enum Action {
    Deposit(Deposit),
    Withdraw(Withdraw),
    Transfer(Transfer),
    TransferToNew(TransferToNew),
    ProxyExit(ProxyExit),
    SetPubKey(SetPubKey),
    FullExit(FullExit),
    ContractToTree(ContractToTree),
    TreeToContract(TreeToContract),
    MintNft(MintNft),
    WithdrawNft(WithdrawNft),
    TransferNft(TransferNft),
    SetVerifyKey(Vec<u8>),
    SetVerifier(Vec<String>),
    SetFee(SetFee),
    CommitProof(CommitProof),
}

/// What an executed action left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Queue ids of the operations appended, fee operation last.
    pub queue_ids: Vec<u64>,
    /// Account root after execution.
    pub root: String,
    pub proof: Option<SubmitOutcome>,
}

/// Split a 32-byte hex content hash into high and low 16-byte halves.
pub fn split_content_hash(hash: &str) -> ZkResult<[String; 2]> {
    let s = hash.strip_prefix("0x").unwrap_or(hash);
    let bytes = hex::decode(s)
        .map_err(|e| ZkError::malformed(format!("content hash {}: {}", hash, e)))?;
    if bytes.len() != 32 {
        return Err(ZkError::malformed(format!(
            "content hash must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok([
        BigUint::from_bytes_be(&bytes[..16]).to_string(),
        BigUint::from_bytes_be(&bytes[16..]).to_string(),
    ])
}

fn require_positive(amount: &str) -> ZkResult<()> {
    if parse_decimal(amount)?.is_zero() {
        return Err(ZkError::malformed("amount must be positive"));
    }
    Ok(())
}

fn require_normal_token(token_id: u64) -> ZkResult<()> {
    if is_normal_token(token_id) {
        Ok(())
    } else {
        Err(ZkError::malformed(format!(
            "token {} is not a fungible token",
            token_id
        )))
    }
}

fn require_nft_token(token_id: u64) -> ZkResult<()> {
    if is_nft_token(token_id) {
        Ok(())
    } else {
        Err(ZkError::malformed(format!("token {} is not an NFT", token_id)))
    }
}

/// Actions whose operation carries a fee.
fn takes_fee(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Withdraw
            | OpKind::Transfer
            | OpKind::TransferToNew
            | OpKind::ProxyExit
            | OpKind::FullExit
            | OpKind::ContractToTree
            | OpKind::TreeToContract
            | OpKind::MintNft
            | OpKind::WithdrawNft
            | OpKind::TransferNft
    )
}

/// The `Fee` operation following `op`, if it pays anything.
fn fee_operation(op: &Operation) -> ZkResult<Option<Operation>> {
    let Some((_, token_id, fee)) = op.fee_payment() else {
        return Ok(None);
    };
    if parse_decimal(fee)?.is_zero() {
        return Ok(None);
    }
    Ok(Some(Operation::Fee(FeeOp {
        account_id: FEE_ACCOUNT_ID,
        token_id,
        amount: fee.to_string(),
    })))
}

pub struct Executor<'a, V: Verifier + ?Sized> {
    store: &'a dyn StateStore,
    verifier: &'a V,
    config: &'a ZkConfig,
}

impl<'a, V: Verifier + ?Sized> Executor<'a, V> {
    pub fn new(store: &'a dyn StateStore, verifier: &'a V, config: &'a ZkConfig) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    fn proof_chain(&self) -> ProofChain<'a, V> {
        ProofChain::new(self.store, self.verifier, self.config)
    }

    /// Ledger with the reserved accounts in place.
    fn ledger(&self) -> ZkResult<Ledger<'a>> {
        let mut ledger = Ledger::new(self.store);
        if ledger.get_leaf(FEE_ACCOUNT_ID)?.is_none() {
            ledger.init_genesis(&self.config.eth_fee_addr, &self.config.chain33_fee_addr)?;
        }
        Ok(ledger)
    }

    /// Execute `action` sent by `caller` at host height `height`.
    ///
    /// Either every write of the action reaches the store or none does.
    pub fn execute(&self, caller: &str, action: Action, height: u64) -> ZkResult<Receipt> {
        self.store.begin_batch()?;
        match self.dispatch(caller, action, height) {
            Ok(receipt) => {
                self.store.commit_batch()?;
                Ok(receipt)
            }
            Err(e) => {
                self.store.discard_batch()?;
                Err(e)
            }
        }
    }

    fn dispatch(&self, caller: &str, action: Action, height: u64) -> ZkResult<Receipt> {
        match action {
            Action::Deposit(p) => self.deposit(caller, p),
            Action::Withdraw(p) => self.withdraw(p),
            Action::Transfer(p) => self.transfer(p),
            Action::TransferToNew(p) => self.transfer_to_new(p),
            Action::ProxyExit(p) => self.proxy_exit(p),
            Action::SetPubKey(p) => self.set_pub_key(p),
            Action::FullExit(p) => self.full_exit(caller, p),
            Action::ContractToTree(p) => self.contract_to_tree(p),
            Action::TreeToContract(p) => self.tree_to_contract(p),
            Action::MintNft(p) => self.mint_nft(p),
            Action::WithdrawNft(p) => self.withdraw_nft(p),
            Action::TransferNft(p) => self.transfer_nft(p),
            Action::SetVerifyKey(key) => {
                self.proof_chain().set_verify_key(caller, &key)?;
                self.receipt(Vec::new(), None)
            }
            Action::SetVerifier(verifiers) => {
                self.proof_chain().set_verifiers(caller, verifiers)?;
                self.receipt(Vec::new(), None)
            }
            Action::SetFee(p) => self.set_fee(caller, p),
            Action::CommitProof(proof) => {
                let outcome = self.proof_chain().submit(caller, proof, height)?;
                self.receipt(Vec::new(), Some(outcome))
            }
        }
    }

    fn receipt(&self, queue_ids: Vec<u64>, proof: Option<SubmitOutcome>) -> ZkResult<Receipt> {
        Ok(Receipt {
            queue_ids,
            root: Ledger::new(self.store).root()?,
            proof,
        })
    }

    /// Apply `op` and its fee, then queue both.
    fn run(&self, op: Operation) -> ZkResult<Receipt> {
        let fee_op = fee_operation(&op)?;
        encode_operation(&op)?;
        if let Some(fee_op) = &fee_op {
            encode_operation(fee_op)?;
        }

        let mut ledger = self.ledger()?;
        apply_operation(&mut ledger, &op)?;
        let queue = OperationQueue::new(self.store);
        let mut queue_ids = vec![queue.append(&op)?];
        if let Some(fee_op) = fee_op {
            apply_operation(&mut ledger, &fee_op)?;
            queue_ids.push(queue.append(&fee_op)?);
        }

        let root = ledger.root()?;
        info!("Executed {:?} as queue {:?}, root={}", op.kind(), queue_ids, root);
        Ok(Receipt {
            queue_ids,
            root,
            proof: None,
        })
    }

    fn require_leaf(&self, ledger: &Ledger, account_id: u64) -> ZkResult<AccountLeaf> {
        ledger
            .get_leaf(account_id)?
            .ok_or_else(|| ZkError::not_found(format!("account {}", account_id)))
    }

    fn balance(&self, ledger: &Ledger, account_id: u64, token_id: u64) -> ZkResult<BigUint> {
        match ledger.get_token(account_id, token_id)? {
            Some(token) => parse_decimal(&token.balance),
            None => Ok(BigUint::zero()),
        }
    }

    /// Existing account for an address pair, or the id a new one would get.
    fn resolve_pair(&self, ledger: &Ledger, chain33: &str, eth: &str) -> ZkResult<(u64, bool)> {
        match ledger.account_id_by_addresses(chain33, eth)? {
            Some(account_id) => Ok((account_id, true)),
            None => Ok((ledger.account_count()?, false)),
        }
    }

    /// `fee` when given, otherwise the manager-set fee for `kind` in `token_id`.
    fn resolve_fee(&self, kind: OpKind, token_id: u64, fee: Option<String>) -> ZkResult<String> {
        match fee {
            Some(fee) => Ok(fee),
            None => Ok(self
                .store
                .get_fee(kind.tag(), token_id)?
                .unwrap_or_else(|| "0".to_string())),
        }
    }

    fn set_fee(&self, caller: &str, p: SetFee) -> ZkResult<Receipt> {
        self.proof_chain().require_prover(caller)?;
        if !takes_fee(p.action) {
            return Err(ZkError::malformed(format!("{:?} does not pay a fee", p.action)));
        }
        check_pack_value(&p.fee, PACKED_FEE_MAN_BITS)?;

        let previous = self.store.get_fee(p.action.tag(), p.token_id)?;
        self.store.put_fee(p.action.tag(), p.token_id, &p.fee)?;
        info!(
            "Fee for {:?} in token {} set to {} (was {})",
            p.action,
            p.token_id,
            p.fee,
            previous.as_deref().unwrap_or("0")
        );
        self.receipt(Vec::new(), None)
    }

    fn check_priority_id(&self, priority_id: u64) -> ZkResult<()> {
        let last = self.store.get_counter(meta::LAST_PRIORITY_ID)?;
        if priority_id != last + 1 {
            return Err(ZkError::ChainLinkage(format!(
                "priority id {} does not follow {}",
                priority_id, last
            )));
        }
        Ok(())
    }

    fn deposit(&self, caller: &str, p: Deposit) -> ZkResult<Receipt> {
        self.proof_chain().require_prover(caller)?;
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        self.check_priority_id(p.priority_id)?;

        let eth = hex_to_decimal(&p.eth_address)?;
        let chain33 = hex_to_decimal(&p.chain33_address)?;
        let ledger = self.ledger()?;
        let (account_id, _) = self.resolve_pair(&ledger, &chain33, &eth)?;

        let receipt = self.run(Operation::Deposit(DepositOp {
            account_id,
            token_id: p.token_id,
            amount: p.amount,
            eth_address: eth,
            layer2_address: chain33,
        }))?;
        self.store.set_counter(meta::LAST_PRIORITY_ID, p.priority_id)?;
        Ok(receipt)
    }

    fn withdraw(&self, p: Withdraw) -> ZkResult<Receipt> {
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        let leaf = self.require_leaf(&self.ledger()?, p.account_id)?;
        self.run(Operation::Withdraw(WithdrawOp {
            account_id: p.account_id,
            token_id: p.token_id,
            amount: p.amount,
            eth_address: leaf.eth_address,
            fee: self.resolve_fee(OpKind::Withdraw, p.token_id, p.fee)?,
        }))
    }

    fn transfer(&self, p: Transfer) -> ZkResult<Receipt> {
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        if p.from_account_id == p.to_account_id {
            return Err(ZkError::malformed("transfer to self"));
        }
        self.run(Operation::Transfer(TransferOp {
            from_account_id: p.from_account_id,
            token_id: p.token_id,
            to_account_id: p.to_account_id,
            amount: p.amount,
            fee: self.resolve_fee(OpKind::Transfer, p.token_id, p.fee)?,
        }))
    }

    /// Falls back to a plain transfer when the receiver already exists.
    fn transfer_to_new(&self, p: TransferToNew) -> ZkResult<Receipt> {
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        let eth = hex_to_decimal(&p.to_eth_address)?;
        let chain33 = hex_to_decimal(&p.to_chain33_address)?;
        let fee = self.resolve_fee(OpKind::TransferToNew, p.token_id, p.fee)?;
        let ledger = self.ledger()?;
        let (to_account_id, exists) = self.resolve_pair(&ledger, &chain33, &eth)?;

        if exists {
            return self.transfer(Transfer {
                from_account_id: p.from_account_id,
                to_account_id,
                token_id: p.token_id,
                amount: p.amount,
                fee: Some(fee),
            });
        }
        self.run(Operation::TransferToNew(TransferToNewOp {
            from_account_id: p.from_account_id,
            token_id: p.token_id,
            to_account_id,
            amount: p.amount,
            eth_address: eth,
            layer2_address: chain33,
            fee,
        }))
    }

    fn proxy_exit(&self, p: ProxyExit) -> ZkResult<Receipt> {
        require_normal_token(p.token_id)?;
        let fee = self.resolve_fee(OpKind::ProxyExit, p.token_id, p.fee)?;
        let ledger = self.ledger()?;
        self.require_leaf(&ledger, p.proxy_id)?;
        let target = self.require_leaf(&ledger, p.target_id)?;

        // The proxy pays the fee and must keep something after it
        let proxy_token = ledger.get_token(p.proxy_id, p.token_id)?.ok_or_else(|| {
            ZkError::not_found(format!("account {} holds no token {}", p.proxy_id, p.token_id))
        })?;
        if parse_decimal(&proxy_token.balance)? <= parse_decimal(&fee)? {
            return Err(ZkError::InsufficientBalance {
                account_id: p.proxy_id,
                token_id: p.token_id,
                balance: proxy_token.balance,
                delta: fee,
            });
        }

        let amount = self.balance(&ledger, p.target_id, p.token_id)?;
        if amount.is_zero() {
            return Err(ZkError::malformed(format!(
                "account {} holds nothing of token {}",
                p.target_id, p.token_id
            )));
        }
        self.run(Operation::ProxyExit(ProxyExitOp {
            proxy_id: p.proxy_id,
            target_id: p.target_id,
            token_id: p.token_id,
            amount: amount.to_string(),
            eth_address: target.eth_address,
            fee,
        }))
    }

    fn set_pub_key(&self, p: SetPubKey) -> ZkResult<Receipt> {
        if PubKeyType::from_u64(p.pub_key_type).is_none() {
            return Err(ZkError::malformed(format!(
                "unknown pub key type {}",
                p.pub_key_type
            )));
        }
        self.run(Operation::SetPubKey(SetPubKeyOp {
            account_id: p.account_id,
            pub_key_type: p.pub_key_type,
            pub_key: p.pub_key,
        }))
    }

    /// Exit the whole balance; the fee comes out of it.
    fn full_exit(&self, caller: &str, p: FullExit) -> ZkResult<Receipt> {
        self.proof_chain().require_prover(caller)?;
        require_normal_token(p.token_id)?;
        self.check_priority_id(p.priority_id)?;

        let ledger = self.ledger()?;
        let leaf = self.require_leaf(&ledger, p.account_id)?;
        let token = ledger.get_token(p.account_id, p.token_id)?.ok_or_else(|| {
            ZkError::not_found(format!("account {} holds no token {}", p.account_id, p.token_id))
        })?;
        let balance = parse_decimal(&token.balance)?;
        let fee = parse_decimal(&self.resolve_fee(OpKind::FullExit, p.token_id, p.fee)?)?;
        let (amount, fee) = if balance > fee {
            (&balance - &fee, fee)
        } else {
            (BigUint::zero(), balance)
        };

        let receipt = self.run(Operation::FullExit(FullExitOp {
            account_id: p.account_id,
            token_id: p.token_id,
            amount: amount.to_string(),
            eth_address: leaf.eth_address,
            fee: fee.to_string(),
        }))?;
        self.store.set_counter(meta::LAST_PRIORITY_ID, p.priority_id)?;
        Ok(receipt)
    }

    fn contract_to_tree(&self, p: ContractToTree) -> ZkResult<Receipt> {
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        let amount = rescale_decimal(&p.amount, self.config.sys_decimal, TREE_DECIMAL)?;
        let fee = self.resolve_fee(OpKind::ContractToTree, p.token_id, p.fee)?;
        let ledger = self.ledger()?;

        let account_id = match p.to_account_id {
            Some(account_id) => account_id,
            None => {
                let eth = hex_to_decimal(&p.to_eth_address)?;
                let chain33 = hex_to_decimal(&p.to_chain33_address)?;
                match self.resolve_pair(&ledger, &chain33, &eth)? {
                    (account_id, true) => account_id,
                    (to_account_id, false) => {
                        return self.run(Operation::ContractToTreeNew(ContractToTreeNewOp {
                            to_account_id,
                            token_id: p.token_id,
                            amount,
                            eth_address: eth,
                            layer2_address: chain33,
                            fee,
                        }));
                    }
                }
            }
        };

        self.require_leaf(&ledger, account_id)?;
        self.run(Operation::ContractToTree(ContractToTreeOp {
            account_id,
            token_id: p.token_id,
            amount,
            fee,
        }))
    }

    /// `amount` is in tree precision and must survive the trip to host precision.
    fn tree_to_contract(&self, p: TreeToContract) -> ZkResult<Receipt> {
        require_positive(&p.amount)?;
        require_normal_token(p.token_id)?;
        rescale_decimal(&p.amount, TREE_DECIMAL, self.config.sys_decimal)?;
        self.run(Operation::TreeToContract(TreeToContractOp {
            account_id: p.account_id,
            token_id: p.token_id,
            amount: p.amount,
            fee: self.resolve_fee(OpKind::TreeToContract, p.token_id, p.fee)?,
        }))
    }

    fn check_nft_shape(protocol: u64, amount: u64) -> ZkResult<()> {
        match protocol {
            NFT_PROTOCOL_ERC1155 if amount > 0 => Ok(()),
            NFT_PROTOCOL_ERC721 if amount == 1 => Ok(()),
            NFT_PROTOCOL_ERC1155 | NFT_PROTOCOL_ERC721 => Err(ZkError::malformed(format!(
                "protocol {} cannot mint amount {}",
                protocol, amount
            ))),
            _ => Err(ZkError::malformed(format!("unknown NFT protocol {}", protocol))),
        }
    }

    fn mint_nft(&self, p: MintNft) -> ZkResult<Receipt> {
        Self::check_nft_shape(p.protocol, p.amount)?;
        require_normal_token(p.fee_token_id)?;
        self.run(Operation::MintNft(MintNftOp {
            mint_account_id: p.from_account_id,
            recipient_id: p.recipient_id,
            protocol: p.protocol,
            amount: p.amount,
            content_hash: split_content_hash(&p.content_hash)?,
            fee_token_id: p.fee_token_id,
            fee: self.resolve_fee(OpKind::MintNft, p.fee_token_id, p.fee)?,
        }))
    }

    fn withdraw_nft(&self, p: WithdrawNft) -> ZkResult<Receipt> {
        require_nft_token(p.nft_token_id)?;
        require_normal_token(p.fee_token_id)?;
        if p.amount == 0 || p.amount > p.init_mint_amount {
            return Err(ZkError::malformed(format!(
                "withdraw amount {} of nft {} minted as {}",
                p.amount, p.nft_token_id, p.init_mint_amount
            )));
        }
        let leaf = self.require_leaf(&self.ledger()?, p.from_account_id)?;
        self.run(Operation::WithdrawNft(WithdrawNftOp {
            from_account_id: p.from_account_id,
            creator_account_id: p.creator_account_id,
            nft_token_id: p.nft_token_id,
            creator_serial_id: p.creator_serial_id,
            protocol: p.protocol,
            init_mint_amount: p.init_mint_amount,
            withdraw_amount: p.amount,
            eth_address: leaf.eth_address,
            content_hash: split_content_hash(&p.content_hash)?,
            fee_token_id: p.fee_token_id,
            fee: self.resolve_fee(OpKind::WithdrawNft, p.fee_token_id, p.fee)?,
        }))
    }

    fn transfer_nft(&self, p: TransferNft) -> ZkResult<Receipt> {
        require_nft_token(p.nft_token_id)?;
        require_normal_token(p.fee_token_id)?;
        if p.amount == 0 {
            return Err(ZkError::malformed("amount must be positive"));
        }
        self.run(Operation::TransferNft(TransferNftOp {
            from_account_id: p.from_account_id,
            recipient_id: p.recipient_id,
            nft_token_id: p.nft_token_id,
            amount: p.amount,
            fee_token_id: p.fee_token_id,
            fee: self.resolve_fee(OpKind::TransferNft, p.fee_token_id, p.fee)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_pubdata;
    use crate::error::ErrorKind;
    use crate::history::{witness_for, HistoryBuilder};
    use crate::ledger::genesis_root;
    use crate::proof_chain::expected_public_input;
    use crate::store::RocksStateStore;
    use tempfile::TempDir;

    const MANAGER: &str = "manager";
    const ETH: &str = "0x0000000000000000000000000000000000000abc";
    const CHAIN33: &str = "0x0def";
    const CONTENT: &str = "0x000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    struct AcceptAll;

    impl Verifier for AcceptAll {
        fn verify(&self, _key: &[u8], _proof: &[u8], _input: &[u8]) -> bool {
            true
        }
    }

    fn create_test_store() -> (RocksStateStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksStateStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn test_config() -> ZkConfig {
        ZkConfig {
            eth_fee_addr: hex_to_decimal("832367164346888E248bd58b9A5f480299F1e88d").unwrap(),
            chain33_fee_addr: hex_to_decimal(
                "2c4a5c378be2424fa7585320630eceba764833f1ec1ffb2fafc1af97f27baf5a",
            )
            .unwrap(),
            super_managers: vec![MANAGER.to_string()],
            sys_decimal: 8,
        }
    }

    fn deposit(amount: &str, eth: &str, chain33: &str, priority_id: u64) -> Action {
        Action::Deposit(Deposit {
            token_id: 1,
            amount: amount.into(),
            eth_address: eth.into(),
            chain33_address: chain33.into(),
            priority_id,
        })
    }

    fn balance(store: &RocksStateStore, account_id: u64, token_id: u64) -> Option<String> {
        Ledger::new(store)
            .get_token(account_id, token_id)
            .unwrap()
            .map(|t| t.balance)
    }

    #[test]
    fn test_deposit_then_query() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);

        let receipt = exec
            .execute(MANAGER, deposit("8000000000000000000", ETH, CHAIN33, 1), 1)
            .unwrap();
        assert_eq!(receipt.queue_ids, vec![1]);
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("8000000000000000000"));

        // Same address pair credits the same account
        exec.execute(MANAGER, deposit("5", ETH, CHAIN33, 2), 2).unwrap();
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("8000000000000000005"));
        assert_eq!(Ledger::new(&store).accounts_by_eth(&hex_to_decimal(ETH).unwrap()).unwrap().len(), 1);
        assert_eq!(OperationQueue::new(&store).last_id().unwrap(), 2);
    }

    #[test]
    fn test_deposit_checks() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);

        let err = exec.execute("user", deposit("1", ETH, CHAIN33, 1), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err = exec.execute(MANAGER, deposit("1", ETH, CHAIN33, 2), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainLinkage);

        let err = exec.execute(MANAGER, deposit("0", ETH, CHAIN33, 1), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        exec.execute(MANAGER, deposit("1", ETH, CHAIN33, 1), 1).unwrap();
        let err = exec.execute(MANAGER, deposit("1", ETH, CHAIN33, 1), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChainLinkage);
        assert_eq!(OperationQueue::new(&store).last_id().unwrap(), 1);
    }

    #[test]
    fn test_fee_is_queued_after_operation() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();

        let receipt = exec
            .execute(
                "user",
                Action::Withdraw(Withdraw {
                    account_id: 4,
                    token_id: 1,
                    amount: "300".into(),
                    fee: Some("7".into()),
                }),
                2,
            )
            .unwrap();
        assert_eq!(receipt.queue_ids, vec![2, 3]);
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("693"));
        assert_eq!(balance(&store, FEE_ACCOUNT_ID, 1).as_deref(), Some("7"));

        let queue = OperationQueue::new(&store);
        assert!(matches!(queue.get(3).unwrap(), Operation::Fee(f) if f.amount == "7"));

        // Zero fee queues nothing extra
        let receipt = exec
            .execute(
                "user",
                Action::Withdraw(Withdraw {
                    account_id: 4,
                    token_id: 1,
                    amount: "3".into(),
                    fee: Some("0".into()),
                }),
                3,
            )
            .unwrap();
        assert_eq!(receipt.queue_ids, vec![4]);
    }

    #[test]
    fn test_unpackable_amount_is_rejected_before_apply() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("100000000000000000000", ETH, CHAIN33, 1), 1)
            .unwrap();
        exec.execute(MANAGER, deposit("1", "0x01", "0x02", 2), 2).unwrap();
        let root = Ledger::new(&store).root().unwrap();

        // 2^35 + 1 needs a 36-bit mantissa
        let err = exec
            .execute(
                "user",
                Action::Transfer(Transfer {
                    from_account_id: 4,
                    to_account_id: 5,
                    token_id: 1,
                    amount: "34359738369".into(),
                    fee: Some("0".into()),
                }),
                3,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert_eq!(Ledger::new(&store).root().unwrap(), root);
        assert_eq!(OperationQueue::new(&store).last_id().unwrap(), 2);
    }

    #[test]
    fn test_transfer_to_new_falls_back_to_transfer() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();

        let send = |amount: &str| {
            Action::TransferToNew(TransferToNew {
                from_account_id: 4,
                token_id: 1,
                amount: amount.into(),
                to_eth_address: "0x77".into(),
                to_chain33_address: "0x88".into(),
                fee: Some("0".into()),
            })
        };
        exec.execute("user", send("100"), 2).unwrap();
        exec.execute("user", send("50"), 3).unwrap();

        assert_eq!(balance(&store, 5, 1).as_deref(), Some("150"));
        let queue = OperationQueue::new(&store);
        assert_eq!(queue.get(2).unwrap().kind(), OpKind::TransferToNew);
        assert_eq!(queue.get(3).unwrap().kind(), OpKind::Transfer);
    }

    #[test]
    fn test_full_exit_takes_fee_from_balance() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();

        let receipt = exec
            .execute(
                MANAGER,
                Action::FullExit(FullExit {
                    account_id: 4,
                    token_id: 1,
                    priority_id: 2,
                    fee: Some("10".into()),
                }),
                2,
            )
            .unwrap();
        assert_eq!(receipt.queue_ids, vec![2, 3]);
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("0"));
        assert_eq!(balance(&store, FEE_ACCOUNT_ID, 1).as_deref(), Some("10"));
        match OperationQueue::new(&store).get(2).unwrap() {
            Operation::FullExit(op) => assert_eq!(op.amount, "990"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_proxy_exit() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        exec.execute(MANAGER, deposit("20", "0x01", "0x02", 2), 2).unwrap();

        exec.execute(
            "proxy",
            Action::ProxyExit(ProxyExit {
                proxy_id: 5,
                target_id: 4,
                token_id: 1,
                fee: Some("5".into()),
            }),
            3,
        )
        .unwrap();
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("0"));
        assert_eq!(balance(&store, 5, 1).as_deref(), Some("15"));
        assert_eq!(balance(&store, FEE_ACCOUNT_ID, 1).as_deref(), Some("5"));
    }

    #[test]
    fn test_bridge_with_rescaling() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("3000000000000000000", ETH, CHAIN33, 1), 1)
            .unwrap();

        // 2e18 in the tree is 2e8 on the host side
        exec.execute(
            "user",
            Action::TreeToContract(TreeToContract {
                account_id: 4,
                token_id: 1,
                amount: "2000000000000000000".into(),
                fee: Some("0".into()),
            }),
            2,
        )
        .unwrap();
        assert_eq!(balance(&store, BRIDGE_ACCOUNT_ID, 1).as_deref(), Some("2000000000000000000"));

        let err = exec
            .execute(
                "user",
                Action::TreeToContract(TreeToContract {
                    account_id: 4,
                    token_id: 1,
                    amount: "1".into(),
                    fee: Some("0".into()),
                }),
                3,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        // Back into a fresh account by address
        exec.execute(
            "user",
            Action::ContractToTree(ContractToTree {
                to_account_id: None,
                to_eth_address: "0x99".into(),
                to_chain33_address: "0xaa".into(),
                token_id: 1,
                amount: "100000000".into(),
                fee: Some("0".into()),
            }),
            4,
        )
        .unwrap();
        assert_eq!(balance(&store, 5, 1).as_deref(), Some("1000000000000000000"));
        assert_eq!(balance(&store, BRIDGE_ACCOUNT_ID, 1).as_deref(), Some("1000000000000000000"));

        exec.execute(
            "user",
            Action::ContractToTree(ContractToTree {
                to_account_id: Some(4),
                to_eth_address: String::new(),
                to_chain33_address: String::new(),
                token_id: 1,
                amount: "100000000".into(),
                fee: Some("0".into()),
            }),
            5,
        )
        .unwrap();
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("2000000000000000000"));
    }

    #[test]
    fn test_nft_lifecycle() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        exec.execute(MANAGER, deposit("1", "0x01", "0x02", 2), 2).unwrap();

        exec.execute(
            "user",
            Action::MintNft(MintNft {
                from_account_id: 4,
                recipient_id: 4,
                protocol: NFT_PROTOCOL_ERC1155,
                amount: 10,
                content_hash: CONTENT.into(),
                fee_token_id: 1,
                fee: Some("1".into()),
            }),
            3,
        )
        .unwrap();
        assert_eq!(balance(&store, 4, FIRST_NFT_TOKEN_ID).as_deref(), Some("10"));

        exec.execute(
            "user",
            Action::TransferNft(TransferNft {
                from_account_id: 4,
                recipient_id: 5,
                nft_token_id: FIRST_NFT_TOKEN_ID,
                amount: 4,
                fee_token_id: 1,
                fee: Some("0".into()),
            }),
            4,
        )
        .unwrap();

        let withdraw = |creator_serial_id: u64| {
            Action::WithdrawNft(WithdrawNft {
                from_account_id: 4,
                nft_token_id: FIRST_NFT_TOKEN_ID,
                amount: 6,
                creator_account_id: 4,
                creator_serial_id,
                protocol: NFT_PROTOCOL_ERC1155,
                init_mint_amount: 10,
                content_hash: CONTENT.into(),
                fee_token_id: 1,
                fee: Some("0".into()),
            })
        };
        assert!(exec.execute("user", withdraw(1), 5).is_err());
        exec.execute("user", withdraw(0), 5).unwrap();
        assert_eq!(balance(&store, 4, FIRST_NFT_TOKEN_ID).as_deref(), Some("0"));
        assert_eq!(balance(&store, 5, FIRST_NFT_TOKEN_ID).as_deref(), Some("4"));

        let bad = exec.execute(
            "user",
            Action::MintNft(MintNft {
                from_account_id: 4,
                recipient_id: 4,
                protocol: NFT_PROTOCOL_ERC721,
                amount: 2,
                content_hash: CONTENT.into(),
                fee_token_id: 1,
                fee: Some("0".into()),
            }),
            6,
        );
        assert_eq!(bad.unwrap_err().kind(), ErrorKind::Malformed);
    }

    #[test]
    fn test_split_content_hash() {
        let [hi, lo] = split_content_hash(CONTENT).unwrap();
        assert_eq!(hi, BigUint::from_bytes_be(&(0u8..16).collect::<Vec<_>>()).to_string());
        assert_eq!(lo, BigUint::from_bytes_be(&(16u8..32).collect::<Vec<_>>()).to_string());
        assert!(split_content_hash("0x1234").is_err());
    }

    #[test]
    fn test_end_to_end_proof_and_witness() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, Action::SetVerifyKey(vec![1, 2]), 0)
            .unwrap();
        let genesis = genesis_root(&config.eth_fee_addr, &config.chain33_fee_addr).unwrap();
        exec.execute(MANAGER, Action::SetVerifier(vec!["prover".into()]), 0)
            .unwrap();

        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        let after = exec
            .execute(
                "user",
                Action::Withdraw(Withdraw {
                    account_id: 4,
                    token_id: 1,
                    amount: "100".into(),
                    fee: Some("2".into()),
                }),
                2,
            )
            .unwrap()
            .root;

        let queue = OperationQueue::new(&store);
        let ops: Vec<Operation> = (1..=3).map(|id| queue.get(id).unwrap()).collect();
        let mut proof = CommitProof {
            proof_id: 1,
            block_start: 1,
            block_end: 2,
            index_start: 0,
            index_end: 0,
            op_index: 0,
            old_tree_root: genesis,
            new_tree_root: after.clone(),
            proof: vec![3],
            public_input: Vec::new(),
            pub_datas: encode_pubdata(&ops).unwrap(),
            on_chain_pub_datas: Vec::new(),
            on_chain_proof_id: 0,
        };
        proof.public_input = expected_public_input(&proof).unwrap();

        let receipt = exec.execute("prover", Action::CommitProof(proof), 3).unwrap();
        assert_eq!(
            receipt.proof,
            Some(SubmitOutcome::Applied {
                proof_id: 1,
                drained: vec![]
            })
        );
        assert_eq!(queue.verified_id().unwrap(), 3);

        let mut history = HistoryBuilder::new(&store, &config);
        let snapshot = history.snapshot_at_proof(1).unwrap();
        assert_eq!(snapshot.root(), after);
        let witness = witness_for(snapshot, 4, 1).unwrap();
        assert_eq!(witness.token.balance, "898");
    }

    fn withdraw(amount: &str, fee: Option<&str>) -> Action {
        Action::Withdraw(Withdraw {
            account_id: 4,
            token_id: 1,
            amount: amount.into(),
            fee: fee.map(String::from),
        })
    }

    #[test]
    fn test_full_exit_of_unheld_token_is_rejected() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();

        let err = exec
            .execute(
                MANAGER,
                Action::FullExit(FullExit {
                    account_id: 4,
                    token_id: 2,
                    priority_id: 2,
                    fee: Some("10".into()),
                }),
                2,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(OperationQueue::new(&store).last_id().unwrap(), 1);
        assert_eq!(store.get_counter(meta::LAST_PRIORITY_ID).unwrap(), 1);
        assert_eq!(balance(&store, 4, 2), None);
    }

    #[test]
    fn test_proxy_exit_needs_more_than_the_fee() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        exec.execute(MANAGER, deposit("20", "0x01", "0x02", 2), 2).unwrap();
        exec.execute(
            MANAGER,
            Action::Deposit(Deposit {
                token_id: 2,
                amount: "50".into(),
                eth_address: ETH.into(),
                chain33_address: CHAIN33.into(),
                priority_id: 3,
            }),
            3,
        )
        .unwrap();

        let proxy_exit = |token_id: u64, fee: &str| {
            Action::ProxyExit(ProxyExit {
                proxy_id: 5,
                target_id: 4,
                token_id,
                fee: Some(fee.into()),
            })
        };

        // Fee equal to the whole proxy balance
        let err = exec.execute("proxy", proxy_exit(1, "20"), 4).unwrap_err();
        assert!(matches!(err, ZkError::InsufficientBalance { account_id: 5, .. }));

        // Proxy never held the token
        let err = exec.execute("proxy", proxy_exit(2, "1"), 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        assert_eq!(balance(&store, 4, 1).as_deref(), Some("1000"));
        assert_eq!(balance(&store, 4, 2).as_deref(), Some("50"));
        assert_eq!(OperationQueue::new(&store).last_id().unwrap(), 3);

        exec.execute("proxy", proxy_exit(1, "19"), 4).unwrap();
        assert_eq!(balance(&store, 5, 1).as_deref(), Some("1"));
    }

    #[test]
    fn test_set_fee_supplies_default_fee() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();

        let set_fee = |action: OpKind, fee: &str| {
            Action::SetFee(SetFee {
                action,
                token_id: 1,
                fee: fee.into(),
            })
        };
        let err = exec.execute("user", set_fee(OpKind::Withdraw, "7"), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);
        let err = exec.execute(MANAGER, set_fee(OpKind::Deposit, "7"), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        // 2048 needs a 12-bit fee mantissa
        let err = exec.execute(MANAGER, set_fee(OpKind::Withdraw, "2048"), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        // No fee set yet: nothing is charged
        let receipt = exec.execute("user", withdraw("10", None), 2).unwrap();
        assert_eq!(receipt.queue_ids, vec![2]);

        let receipt = exec.execute(MANAGER, set_fee(OpKind::Withdraw, "7"), 3).unwrap();
        assert!(receipt.queue_ids.is_empty());
        assert_eq!(store.get_fee(OpKind::Withdraw.tag(), 1).unwrap().as_deref(), Some("7"));

        let receipt = exec.execute("user", withdraw("10", None), 4).unwrap();
        assert_eq!(receipt.queue_ids, vec![3, 4]);
        assert_eq!(balance(&store, FEE_ACCOUNT_ID, 1).as_deref(), Some("7"));
        match OperationQueue::new(&store).get(3).unwrap() {
            Operation::Withdraw(op) => assert_eq!(op.fee, "7"),
            other => panic!("unexpected {:?}", other),
        }

        // The stored fee only applies to its own action
        exec.execute(MANAGER, deposit("1", "0x01", "0x02", 2), 5).unwrap();
        let receipt = exec
            .execute(
                "user",
                Action::Transfer(Transfer {
                    from_account_id: 4,
                    to_account_id: 5,
                    token_id: 1,
                    amount: "10".into(),
                    fee: None,
                }),
                6,
            )
            .unwrap();
        assert_eq!(receipt.queue_ids, vec![6]);
        assert_eq!(balance(&store, 5, 1).as_deref(), Some("11"));
    }

    #[test]
    fn test_explicit_fee_overrides_default() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);
        exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        exec.execute(
            MANAGER,
            Action::SetFee(SetFee {
                action: OpKind::Withdraw,
                token_id: 1,
                fee: "7".into(),
            }),
            2,
        )
        .unwrap();

        let receipt = exec.execute("user", withdraw("10", Some("3")), 2).unwrap();
        assert_eq!(receipt.queue_ids, vec![2, 3]);
        assert_eq!(balance(&store, FEE_ACCOUNT_ID, 1).as_deref(), Some("3"));

        // An explicit zero waives the default
        let receipt = exec.execute("user", withdraw("10", Some("0")), 3).unwrap();
        assert_eq!(receipt.queue_ids, vec![4]);
        assert_eq!(balance(&store, 4, 1).as_deref(), Some("977"));
    }

    #[test]
    fn test_failed_action_leaves_no_writes() {
        let (store, _temp_dir) = create_test_store();
        let config = test_config();
        let exec = Executor::new(&store, &AcceptAll, &config);

        // Genesis is created on first use, then the missing account fails the action
        let err = exec.execute("user", withdraw("10", Some("0")), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(store.get_leaf(FEE_ACCOUNT_ID).unwrap(), None);
        assert_eq!(store.get_counter(meta::LEAF_COUNT).unwrap(), 0);

        // The store is usable again afterwards
        let receipt = exec.execute(MANAGER, deposit("1000", ETH, CHAIN33, 1), 1).unwrap();
        assert_eq!(receipt.queue_ids, vec![1]);
        assert!(store.get_leaf(FEE_ACCOUNT_ID).unwrap().is_some());
        assert_eq!(Ledger::new(&store).root().unwrap(), receipt.root);
    }
}
