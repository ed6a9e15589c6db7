//! Rollup operation types
//!
//! Every ledger-affecting action is one variant of [`Operation`]. The same
//! value is applied to the ledger, appended to the queue and encoded into
//! pubdata chunks, so each payload struct carries exactly the fields that
//! travel on the wire.
//!
//! Amounts, addresses and hashes are decimal text of non-negative integers.

use serde::{Deserialize, Serialize};

/// Default holder, never owned by a user.
pub const DEFAULT_ACCOUNT_ID: u64 = 0;
/// Protocol fee collector.
pub const FEE_ACCOUNT_ID: u64 = 1;
/// Records minted NFTs and the NFT id counter.
pub const NFT_ACCOUNT_ID: u64 = 2;
/// Holds funds moved between the tree and the host contract layer.
pub const BRIDGE_ACCOUNT_ID: u64 = 3;
/// Number of reserved accounts created at genesis.
pub const SYSTEM_ACCOUNT_COUNT: u64 = 4;

/// Token slot used as a counter: on the NFT account it holds the next NFT
/// id, on a creator account the next creator serial.
pub const SYSTEM_NFT_TOKEN_ID: u64 = 256;
/// First NFT id ever minted.
pub const FIRST_NFT_TOKEN_ID: u64 = SYSTEM_NFT_TOKEN_ID + 1;

/// Number of bytes in one pubdata chunk.
pub const CHUNK_BYTES: usize = 28;

/// Mantissa width of a packed amount.
pub const PACKED_AMOUNT_MAN_BITS: u32 = 35;
/// Mantissa width of a packed fee.
pub const PACKED_FEE_MAN_BITS: u32 = 11;
/// Exponent width shared by packed amounts and fees.
pub const PACKED_EXP_BITS: u32 = 5;

/// Fungible tokens live below the NFT counter slot.
pub fn is_normal_token(token_id: u64) -> bool {
    token_id < SYSTEM_NFT_TOKEN_ID
}

pub fn is_nft_token(token_id: u64) -> bool {
    token_id > SYSTEM_NFT_TOKEN_ID
}

/// Baby-jubjub public key, coordinates as decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKey {
    pub x: String,
    pub y: String,
}

/// Slot of a public key inside an account leaf.
///
/// The discriminant is both the wire value and the index into
/// `AccountLeaf::pub_keys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PubKeyType {
    Primary = 0,
    Normal = 1,
    System = 2,
    Super = 3,
}

impl PubKeyType {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(PubKeyType::Primary),
            1 => Some(PubKeyType::Normal),
            2 => Some(PubKeyType::System),
            3 => Some(PubKeyType::Super),
            _ => None,
        }
    }

    pub fn slot(self) -> usize {
        self as usize
    }
}

/// Operation kind, discriminant equal to the leading pubdata tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    Noop = 0,
    Deposit = 1,
    Withdraw = 2,
    Transfer = 3,
    TransferToNew = 4,
    ProxyExit = 5,
    SetPubKey = 6,
    FullExit = 7,
    Swap = 8,
    ContractToTree = 9,
    TreeToContract = 10,
    Fee = 11,
    MintNft = 12,
    WithdrawNft = 13,
    TransferNft = 14,
    ContractToTreeNew = 30,
}

impl OpKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            0 => OpKind::Noop,
            1 => OpKind::Deposit,
            2 => OpKind::Withdraw,
            3 => OpKind::Transfer,
            4 => OpKind::TransferToNew,
            5 => OpKind::ProxyExit,
            6 => OpKind::SetPubKey,
            7 => OpKind::FullExit,
            8 => OpKind::Swap,
            9 => OpKind::ContractToTree,
            10 => OpKind::TreeToContract,
            11 => OpKind::Fee,
            12 => OpKind::MintNft,
            13 => OpKind::WithdrawNft,
            14 => OpKind::TransferNft,
            30 => OpKind::ContractToTreeNew,
            _ => return None,
        };
        Some(kind)
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Fixed number of chunks this kind occupies in pubdata.
    pub fn chunks(self) -> usize {
        match self {
            OpKind::Noop => 1,
            OpKind::Deposit => 3,
            OpKind::Withdraw => 2,
            OpKind::Transfer => 2,
            OpKind::TransferToNew => 3,
            OpKind::ProxyExit => 2,
            OpKind::SetPubKey => 3,
            OpKind::FullExit => 2,
            OpKind::Swap => 4,
            OpKind::ContractToTree => 2,
            OpKind::ContractToTreeNew => 3,
            OpKind::TreeToContract => 2,
            OpKind::Fee => 1,
            OpKind::MintNft => 5,
            OpKind::WithdrawNft => 6,
            OpKind::TransferNft => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub layer2_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOp {
    pub from_account_id: u64,
    pub token_id: u64,
    pub to_account_id: u64,
    pub amount: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferToNewOp {
    pub from_account_id: u64,
    pub token_id: u64,
    pub to_account_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub layer2_address: String,
    pub fee: String,
}

/// Exit of `target_id`'s whole balance, submitted and paid for by a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyExitOp {
    pub proxy_id: u64,
    pub target_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPubKeyOp {
    pub account_id: u64,
    /// Raw slot value, see [`PubKeyType`].
    pub pub_key_type: u64,
    pub pub_key: PubKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullExitOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapOp {
    pub left_account_id: u64,
    pub right_account_id: u64,
    pub left_token_id: u64,
    pub right_token_id: u64,
    pub left_deal_amount: String,
    pub right_deal_amount: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractToTreeOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractToTreeNewOp {
    pub to_account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub eth_address: String,
    pub layer2_address: String,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeToContractOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
    pub fee: String,
}

/// Fee credit to the fee account, queued after every fee-paying operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeOp {
    pub account_id: u64,
    pub token_id: u64,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintNftOp {
    pub mint_account_id: u64,
    pub recipient_id: u64,
    /// ERC-721 / ERC-1155 selector.
    pub protocol: u64,
    pub amount: u64,
    /// High and low 16-byte halves of the content hash.
    pub content_hash: [String; 2],
    pub fee_token_id: u64,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawNftOp {
    pub from_account_id: u64,
    pub creator_account_id: u64,
    pub nft_token_id: u64,
    pub creator_serial_id: u64,
    pub protocol: u64,
    pub init_mint_amount: u64,
    pub withdraw_amount: u64,
    pub eth_address: String,
    pub content_hash: [String; 2],
    pub fee_token_id: u64,
    pub fee: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferNftOp {
    pub from_account_id: u64,
    pub recipient_id: u64,
    pub nft_token_id: u64,
    pub amount: u64,
    pub fee_token_id: u64,
    pub fee: String,
}

/// A ledger-affecting operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Noop,
    Deposit(DepositOp),
    Withdraw(WithdrawOp),
    Transfer(TransferOp),
    TransferToNew(TransferToNewOp),
    ProxyExit(ProxyExitOp),
    SetPubKey(SetPubKeyOp),
    FullExit(FullExitOp),
    Swap(SwapOp),
    ContractToTree(ContractToTreeOp),
    ContractToTreeNew(ContractToTreeNewOp),
    TreeToContract(TreeToContractOp),
    Fee(FeeOp),
    MintNft(MintNftOp),
    WithdrawNft(WithdrawNftOp),
    TransferNft(TransferNftOp),
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Noop => OpKind::Noop,
            Operation::Deposit(_) => OpKind::Deposit,
            Operation::Withdraw(_) => OpKind::Withdraw,
            Operation::Transfer(_) => OpKind::Transfer,
            Operation::TransferToNew(_) => OpKind::TransferToNew,
            Operation::ProxyExit(_) => OpKind::ProxyExit,
            Operation::SetPubKey(_) => OpKind::SetPubKey,
            Operation::FullExit(_) => OpKind::FullExit,
            Operation::Swap(_) => OpKind::Swap,
            Operation::ContractToTree(_) => OpKind::ContractToTree,
            Operation::ContractToTreeNew(_) => OpKind::ContractToTreeNew,
            Operation::TreeToContract(_) => OpKind::TreeToContract,
            Operation::Fee(_) => OpKind::Fee,
            Operation::MintNft(_) => OpKind::MintNft,
            Operation::WithdrawNft(_) => OpKind::WithdrawNft,
            Operation::TransferNft(_) => OpKind::TransferNft,
        }
    }

    /// Account, token and amount of the fee this operation pays, if any.
    ///
    /// Swap fees are paid by the left side in the left token.
    pub fn fee_payment(&self) -> Option<(u64, u64, &str)> {
        match self {
            Operation::Withdraw(op) => Some((op.account_id, op.token_id, op.fee.as_str())),
            Operation::Transfer(op) => Some((op.from_account_id, op.token_id, op.fee.as_str())),
            Operation::TransferToNew(op) => {
                Some((op.from_account_id, op.token_id, op.fee.as_str()))
            }
            Operation::ProxyExit(op) => Some((op.proxy_id, op.token_id, op.fee.as_str())),
            Operation::FullExit(op) => Some((op.account_id, op.token_id, op.fee.as_str())),
            Operation::Swap(op) => Some((op.left_account_id, op.left_token_id, op.fee.as_str())),
            Operation::ContractToTree(op) => {
                Some((BRIDGE_ACCOUNT_ID, op.token_id, op.fee.as_str()))
            }
            Operation::ContractToTreeNew(op) => {
                Some((BRIDGE_ACCOUNT_ID, op.token_id, op.fee.as_str()))
            }
            Operation::TreeToContract(op) => Some((op.account_id, op.token_id, op.fee.as_str())),
            Operation::MintNft(op) => {
                Some((op.mint_account_id, op.fee_token_id, op.fee.as_str()))
            }
            Operation::WithdrawNft(op) => {
                Some((op.from_account_id, op.fee_token_id, op.fee.as_str()))
            }
            Operation::TransferNft(op) => {
                Some((op.from_account_id, op.fee_token_id, op.fee.as_str()))
            }
            Operation::Noop | Operation::Deposit(_) | Operation::SetPubKey(_) | Operation::Fee(_) => {
                None
            }
        }
    }
}
