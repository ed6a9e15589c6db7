//! Pubdata chunk codec
//!
//! Each operation kind has a schema: an ordered list of named fixed-width
//! fields written big-endian right after the one-byte kind tag. The encoded
//! operation is zero-padded to its kind's chunk count. Encoding, decoding
//! and queue reconciliation all walk the same schema table, so the field
//! offsets cannot drift apart.
//!
//! A pubdata entry is the decimal text of one 28-byte chunk.

use crate::error::{ZkError, ZkResult};
use crate::mimc::parse_decimal;
use crate::types::*;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

/// Wire shape of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// 4-byte account id.
    AccountId,
    /// 4-byte token id.
    TokenId,
    /// 1-byte small integer (pubkey type, NFT protocol).
    Byte,
    /// 2-byte NFT amount or serial.
    NftAmount,
    /// 16-byte full-width amount.
    Amount,
    /// 20-byte host-chain address.
    EthAddress,
    /// 32-byte layer-2 address.
    Layer2Address,
    /// 32-byte public key coordinate.
    PubKeyCoord,
    /// 16-byte half of a content hash.
    HalfHash,
    /// 35-bit mantissa + 5-bit exponent.
    PackedAmount,
    /// 11-bit mantissa + 5-bit exponent.
    PackedFee,
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::AccountId | FieldKind::TokenId => 4,
            FieldKind::Byte => 1,
            FieldKind::NftAmount => 2,
            FieldKind::Amount | FieldKind::HalfHash => 16,
            FieldKind::EthAddress => 20,
            FieldKind::Layer2Address | FieldKind::PubKeyCoord => 32,
            FieldKind::PackedAmount => packed_width(PACKED_AMOUNT_MAN_BITS),
            FieldKind::PackedFee => packed_width(PACKED_FEE_MAN_BITS),
        }
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            FieldKind::AccountId | FieldKind::TokenId | FieldKind::Byte | FieldKind::NftAmount
        )
    }
}

/// Value of one schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Int(u64),
    Dec(String),
}

type Schema = &'static [(&'static str, FieldKind)];

use FieldKind::*;

const DEPOSIT: Schema = &[
    ("account_id", AccountId),
    ("token_id", TokenId),
    ("amount", Amount),
    ("eth_address", EthAddress),
    ("layer2_address", Layer2Address),
];
const WITHDRAW: Schema = &[
    ("account_id", AccountId),
    ("token_id", TokenId),
    ("amount", Amount),
    ("eth_address", EthAddress),
    ("fee", PackedFee),
];
const TRANSFER: Schema = &[
    ("from_account_id", AccountId),
    ("token_id", TokenId),
    ("to_account_id", AccountId),
    ("amount", PackedAmount),
    ("fee", PackedFee),
];
const TRANSFER_TO_NEW: Schema = &[
    ("from_account_id", AccountId),
    ("token_id", TokenId),
    ("to_account_id", AccountId),
    ("amount", PackedAmount),
    ("eth_address", EthAddress),
    ("layer2_address", Layer2Address),
    ("fee", PackedFee),
];
const PROXY_EXIT: Schema = &[
    ("proxy_id", AccountId),
    ("target_id", AccountId),
    ("token_id", TokenId),
    ("amount", Amount),
    ("eth_address", EthAddress),
    ("fee", PackedFee),
];
const SET_PUB_KEY: Schema = &[
    ("account_id", AccountId),
    ("pub_key_type", Byte),
    ("pub_key.x", PubKeyCoord),
    ("pub_key.y", PubKeyCoord),
];
const FULL_EXIT: Schema = &[
    ("account_id", AccountId),
    ("token_id", TokenId),
    ("amount", Amount),
    ("eth_address", EthAddress),
    ("fee", PackedFee),
];
const SWAP: Schema = &[
    ("left_account_id", AccountId),
    ("right_account_id", AccountId),
    ("left_token_id", TokenId),
    ("right_token_id", TokenId),
    ("left_deal_amount", PackedAmount),
    ("right_deal_amount", PackedAmount),
    ("fee", PackedFee),
];
const CONTRACT_TO_TREE: Schema = &[
    ("account_id", AccountId),
    ("token_id", TokenId),
    ("amount", PackedAmount),
    ("fee", PackedFee),
];
const CONTRACT_TO_TREE_NEW: Schema = &[
    ("to_account_id", AccountId),
    ("token_id", TokenId),
    ("amount", PackedAmount),
    ("eth_address", EthAddress),
    ("layer2_address", Layer2Address),
    ("fee", PackedFee),
];
const TREE_TO_CONTRACT: Schema = CONTRACT_TO_TREE;
const FEE: Schema = &[
    ("account_id", AccountId),
    ("token_id", TokenId),
    ("amount", PackedFee),
];
const MINT_NFT: Schema = &[
    ("mint_account_id", AccountId),
    ("recipient_id", AccountId),
    ("protocol", Byte),
    ("amount", NftAmount),
    ("content_hash[0]", HalfHash),
    ("content_hash[1]", HalfHash),
    ("fee_token_id", TokenId),
    ("fee", PackedFee),
];
const WITHDRAW_NFT: Schema = &[
    ("from_account_id", AccountId),
    ("creator_account_id", AccountId),
    ("nft_token_id", TokenId),
    ("creator_serial_id", NftAmount),
    ("protocol", Byte),
    ("init_mint_amount", NftAmount),
    ("withdraw_amount", NftAmount),
    ("eth_address", EthAddress),
    ("content_hash[0]", HalfHash),
    ("content_hash[1]", HalfHash),
    ("fee_token_id", TokenId),
    ("fee", PackedFee),
];
const TRANSFER_NFT: Schema = &[
    ("from_account_id", AccountId),
    ("recipient_id", AccountId),
    ("nft_token_id", TokenId),
    ("amount", NftAmount),
    ("fee_token_id", TokenId),
    ("fee", PackedFee),
];

fn schema(kind: OpKind) -> Schema {
    match kind {
        OpKind::Noop => &[],
        OpKind::Deposit => DEPOSIT,
        OpKind::Withdraw => WITHDRAW,
        OpKind::Transfer => TRANSFER,
        OpKind::TransferToNew => TRANSFER_TO_NEW,
        OpKind::ProxyExit => PROXY_EXIT,
        OpKind::SetPubKey => SET_PUB_KEY,
        OpKind::FullExit => FULL_EXIT,
        OpKind::Swap => SWAP,
        OpKind::ContractToTree => CONTRACT_TO_TREE,
        OpKind::ContractToTreeNew => CONTRACT_TO_TREE_NEW,
        OpKind::TreeToContract => TREE_TO_CONTRACT,
        OpKind::Fee => FEE,
        OpKind::MintNft => MINT_NFT,
        OpKind::WithdrawNft => WITHDRAW_NFT,
        OpKind::TransferNft => TRANSFER_NFT,
    }
}

fn int(v: u64) -> FieldValue {
    FieldValue::Int(v)
}

fn dec(v: &str) -> FieldValue {
    FieldValue::Dec(v.to_string())
}

/// Field values of `op` in schema order.
pub fn op_fields(op: &Operation) -> Vec<FieldValue> {
    match op {
        Operation::Noop => vec![],
        Operation::Deposit(o) => vec![
            int(o.account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.layer2_address),
        ],
        Operation::Withdraw(o) => vec![
            int(o.account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.fee),
        ],
        Operation::Transfer(o) => vec![
            int(o.from_account_id),
            int(o.token_id),
            int(o.to_account_id),
            dec(&o.amount),
            dec(&o.fee),
        ],
        Operation::TransferToNew(o) => vec![
            int(o.from_account_id),
            int(o.token_id),
            int(o.to_account_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.layer2_address),
            dec(&o.fee),
        ],
        Operation::ProxyExit(o) => vec![
            int(o.proxy_id),
            int(o.target_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.fee),
        ],
        Operation::SetPubKey(o) => vec![
            int(o.account_id),
            int(o.pub_key_type),
            dec(&o.pub_key.x),
            dec(&o.pub_key.y),
        ],
        Operation::FullExit(o) => vec![
            int(o.account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.fee),
        ],
        Operation::Swap(o) => vec![
            int(o.left_account_id),
            int(o.right_account_id),
            int(o.left_token_id),
            int(o.right_token_id),
            dec(&o.left_deal_amount),
            dec(&o.right_deal_amount),
            dec(&o.fee),
        ],
        Operation::ContractToTree(o) => vec![
            int(o.account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.fee),
        ],
        Operation::ContractToTreeNew(o) => vec![
            int(o.to_account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.eth_address),
            dec(&o.layer2_address),
            dec(&o.fee),
        ],
        Operation::TreeToContract(o) => vec![
            int(o.account_id),
            int(o.token_id),
            dec(&o.amount),
            dec(&o.fee),
        ],
        Operation::Fee(o) => vec![int(o.account_id), int(o.token_id), dec(&o.amount)],
        Operation::MintNft(o) => vec![
            int(o.mint_account_id),
            int(o.recipient_id),
            int(o.protocol),
            int(o.amount),
            dec(&o.content_hash[0]),
            dec(&o.content_hash[1]),
            int(o.fee_token_id),
            dec(&o.fee),
        ],
        Operation::WithdrawNft(o) => vec![
            int(o.from_account_id),
            int(o.creator_account_id),
            int(o.nft_token_id),
            int(o.creator_serial_id),
            int(o.protocol),
            int(o.init_mint_amount),
            int(o.withdraw_amount),
            dec(&o.eth_address),
            dec(&o.content_hash[0]),
            dec(&o.content_hash[1]),
            int(o.fee_token_id),
            dec(&o.fee),
        ],
        Operation::TransferNft(o) => vec![
            int(o.from_account_id),
            int(o.recipient_id),
            int(o.nft_token_id),
            int(o.amount),
            int(o.fee_token_id),
            dec(&o.fee),
        ],
    }
}

/// Pops schema values in order while rebuilding an operation.
struct Fields(std::vec::IntoIter<FieldValue>);

impl Fields {
    fn int(&mut self) -> ZkResult<u64> {
        match self.0.next() {
            Some(FieldValue::Int(v)) => Ok(v),
            _ => Err(ZkError::malformed("expected integer field")),
        }
    }

    fn dec(&mut self) -> ZkResult<String> {
        match self.0.next() {
            Some(FieldValue::Dec(v)) => Ok(v),
            _ => Err(ZkError::malformed("expected decimal field")),
        }
    }
}

fn op_from_fields(kind: OpKind, values: Vec<FieldValue>) -> ZkResult<Operation> {
    let mut f = Fields(values.into_iter());
    let op = match kind {
        OpKind::Noop => Operation::Noop,
        OpKind::Deposit => Operation::Deposit(DepositOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            layer2_address: f.dec()?,
        }),
        OpKind::Withdraw => Operation::Withdraw(WithdrawOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::Transfer => Operation::Transfer(TransferOp {
            from_account_id: f.int()?,
            token_id: f.int()?,
            to_account_id: f.int()?,
            amount: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::TransferToNew => Operation::TransferToNew(TransferToNewOp {
            from_account_id: f.int()?,
            token_id: f.int()?,
            to_account_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            layer2_address: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::ProxyExit => Operation::ProxyExit(ProxyExitOp {
            proxy_id: f.int()?,
            target_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::SetPubKey => Operation::SetPubKey(SetPubKeyOp {
            account_id: f.int()?,
            pub_key_type: f.int()?,
            pub_key: PubKey {
                x: f.dec()?,
                y: f.dec()?,
            },
        }),
        OpKind::FullExit => Operation::FullExit(FullExitOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::Swap => Operation::Swap(SwapOp {
            left_account_id: f.int()?,
            right_account_id: f.int()?,
            left_token_id: f.int()?,
            right_token_id: f.int()?,
            left_deal_amount: f.dec()?,
            right_deal_amount: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::ContractToTree => Operation::ContractToTree(ContractToTreeOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::ContractToTreeNew => Operation::ContractToTreeNew(ContractToTreeNewOp {
            to_account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            eth_address: f.dec()?,
            layer2_address: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::TreeToContract => Operation::TreeToContract(TreeToContractOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
            fee: f.dec()?,
        }),
        OpKind::Fee => Operation::Fee(FeeOp {
            account_id: f.int()?,
            token_id: f.int()?,
            amount: f.dec()?,
        }),
        OpKind::MintNft => Operation::MintNft(MintNftOp {
            mint_account_id: f.int()?,
            recipient_id: f.int()?,
            protocol: f.int()?,
            amount: f.int()?,
            content_hash: [f.dec()?, f.dec()?],
            fee_token_id: f.int()?,
            fee: f.dec()?,
        }),
        OpKind::WithdrawNft => Operation::WithdrawNft(WithdrawNftOp {
            from_account_id: f.int()?,
            creator_account_id: f.int()?,
            nft_token_id: f.int()?,
            creator_serial_id: f.int()?,
            protocol: f.int()?,
            init_mint_amount: f.int()?,
            withdraw_amount: f.int()?,
            eth_address: f.dec()?,
            content_hash: [f.dec()?, f.dec()?],
            fee_token_id: f.int()?,
            fee: f.dec()?,
        }),
        OpKind::TransferNft => Operation::TransferNft(TransferNftOp {
            from_account_id: f.int()?,
            recipient_id: f.int()?,
            nft_token_id: f.int()?,
            amount: f.int()?,
            fee_token_id: f.int()?,
            fee: f.dec()?,
        }),
    };
    Ok(op)
}

// ─────────────────────────────────────────────────────────────────
// Packed amounts
// ─────────────────────────────────────────────────────────────────

fn packed_width(man_bits: u32) -> usize {
    ((man_bits + PACKED_EXP_BITS) / 8) as usize
}

/// Split a value into (mantissa, exponent) with the exponent as large as
/// the trailing decimal zeros allow, capped by the exponent width.
fn split_man_exp(value: &BigUint) -> (BigUint, u32) {
    let max_exp = (1u32 << PACKED_EXP_BITS) - 1;
    let mut man = value.clone();
    let mut exp = 0u32;
    if man.is_zero() {
        return (man, 0);
    }
    while exp < max_exp && (&man % 10u32).is_zero() {
        man /= 10u32;
        exp += 1;
    }
    (man, exp)
}

/// Check that `amount` is representable with a `man_bits` mantissa.
pub fn check_pack_value(amount: &str, man_bits: u32) -> ZkResult<()> {
    let value = parse_decimal(amount)?;
    let (man, _) = split_man_exp(&value);
    if man.bits() > u64::from(man_bits) {
        return Err(ZkError::malformed(format!(
            "packed value {} needs a mantissa of {} bits, max {}",
            amount,
            man.bits(),
            man_bits
        )));
    }
    Ok(())
}

/// Pack a decimal amount into `(man_bits + 5) / 8` bytes.
pub fn encode_packed(amount: &str, man_bits: u32) -> ZkResult<Vec<u8>> {
    check_pack_value(amount, man_bits)?;
    let (man, exp) = split_man_exp(&parse_decimal(amount)?);
    let packed = (man << PACKED_EXP_BITS as usize) | BigUint::from(exp);
    to_fixed_be(&packed, packed_width(man_bits), "packed value")
}

/// Unpack bytes produced by [`encode_packed`] into decimal text.
pub fn decode_packed(bytes: &[u8]) -> String {
    let packed = BigUint::from_bytes_be(bytes);
    let exp_mask = BigUint::from((1u32 << PACKED_EXP_BITS) - 1);
    let exp = (&packed & &exp_mask).to_u32().unwrap_or(0);
    let man = packed >> PACKED_EXP_BITS as usize;
    (man * BigUint::from(10u32).pow(exp)).to_string()
}

fn to_fixed_be(value: &BigUint, width: usize, name: &str) -> ZkResult<Vec<u8>> {
    let raw = if value.is_zero() {
        Vec::new()
    } else {
        value.to_bytes_be()
    };
    if raw.len() > width {
        return Err(ZkError::malformed(format!(
            "{} = {} does not fit in {} bytes",
            name, value, width
        )));
    }
    let mut out = vec![0u8; width - raw.len()];
    out.extend_from_slice(&raw);
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────
// Operation <-> chunk bytes
// ─────────────────────────────────────────────────────────────────

fn write_field(buf: &mut Vec<u8>, name: &str, kind: FieldKind, value: &FieldValue) -> ZkResult<()> {
    let bytes = match (kind, value) {
        (k, FieldValue::Int(v)) if k.is_integer() => {
            to_fixed_be(&BigUint::from(*v), k.width(), name)?
        }
        (PackedAmount, FieldValue::Dec(v)) => encode_packed(v, PACKED_AMOUNT_MAN_BITS)?,
        (PackedFee, FieldValue::Dec(v)) => encode_packed(v, PACKED_FEE_MAN_BITS)?,
        (k, FieldValue::Dec(v)) if !k.is_integer() => {
            to_fixed_be(&parse_decimal(v)?, k.width(), name)?
        }
        _ => {
            return Err(ZkError::malformed(format!(
                "field {} has the wrong value type",
                name
            )))
        }
    };
    buf.extend_from_slice(&bytes);
    Ok(())
}

fn read_field(bytes: &[u8], kind: FieldKind) -> FieldValue {
    match kind {
        PackedAmount | PackedFee => FieldValue::Dec(decode_packed(bytes)),
        k if k.is_integer() => {
            FieldValue::Int(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
        }
        _ => FieldValue::Dec(BigUint::from_bytes_be(bytes).to_string()),
    }
}

/// Encode an operation into its chunk bytes (`chunks * 28` bytes).
pub fn encode_operation(op: &Operation) -> ZkResult<Vec<u8>> {
    let kind = op.kind();
    let total = kind.chunks() * CHUNK_BYTES;
    let mut buf = Vec::with_capacity(total);
    buf.push(kind.tag());
    for ((name, field), value) in schema(kind).iter().zip(op_fields(op).iter()) {
        write_field(&mut buf, name, *field, value)?;
    }
    if buf.len() > total {
        return Err(ZkError::malformed(format!(
            "{:?} encoding overflows {} chunks",
            kind,
            kind.chunks()
        )));
    }
    buf.resize(total, 0);
    Ok(buf)
}

/// Decode one operation from exactly its chunk bytes.
pub fn decode_operation(bytes: &[u8]) -> ZkResult<Operation> {
    let tag = *bytes
        .first()
        .ok_or_else(|| ZkError::malformed("empty operation chunk"))?;
    let kind = OpKind::from_tag(tag)
        .ok_or_else(|| ZkError::malformed(format!("unsupported operation tag {}", tag)))?;
    let expected = kind.chunks() * CHUNK_BYTES;
    if bytes.len() != expected {
        return Err(ZkError::malformed(format!(
            "{:?} needs {} bytes, got {}",
            kind,
            expected,
            bytes.len()
        )));
    }

    let mut offset = 1;
    let mut values = Vec::new();
    for (_, field) in schema(kind) {
        let end = offset + field.width();
        values.push(read_field(&bytes[offset..end], *field));
        offset = end;
    }
    if bytes[offset..].iter().any(|b| *b != 0) {
        return Err(ZkError::malformed(format!(
            "{:?} chunk padding is not zero",
            kind
        )));
    }
    op_from_fields(kind, values)
}

// ─────────────────────────────────────────────────────────────────
// Pubdata text
// ─────────────────────────────────────────────────────────────────

/// Split chunk bytes into pubdata entries.
pub fn chunks_to_pubdata(bytes: &[u8]) -> ZkResult<Vec<String>> {
    if bytes.len() % CHUNK_BYTES != 0 {
        return Err(ZkError::malformed(format!(
            "chunk bytes length {} is not a multiple of {}",
            bytes.len(),
            CHUNK_BYTES
        )));
    }
    Ok(bytes
        .chunks(CHUNK_BYTES)
        .map(|c| BigUint::from_bytes_be(c).to_string())
        .collect())
}

/// Join pubdata entries back into chunk bytes.
pub fn pubdata_to_bytes(pub_datas: &[String]) -> ZkResult<Vec<u8>> {
    let mut out = Vec::with_capacity(pub_datas.len() * CHUNK_BYTES);
    for (i, entry) in pub_datas.iter().enumerate() {
        let value = parse_decimal(entry)?;
        out.extend(to_fixed_be(&value, CHUNK_BYTES, &format!("pubdata[{}]", i))?);
    }
    Ok(out)
}

pub fn encode_pubdata(ops: &[Operation]) -> ZkResult<Vec<String>> {
    let mut bytes = Vec::new();
    for op in ops {
        bytes.extend(encode_operation(op)?);
    }
    chunks_to_pubdata(&bytes)
}

/// Decode a pubdata list into the operations it carries, skipping Noop
/// chunks.
pub fn decode_pubdata(pub_datas: &[String]) -> ZkResult<Vec<Operation>> {
    let bytes = pubdata_to_bytes(pub_datas)?;
    let mut ops = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let tag = bytes[offset];
        let kind = OpKind::from_tag(tag).ok_or_else(|| {
            ZkError::malformed(format!(
                "unsupported operation tag {} at chunk {}",
                tag,
                offset / CHUNK_BYTES
            ))
        })?;
        let end = offset + kind.chunks() * CHUNK_BYTES;
        if end > bytes.len() {
            return Err(ZkError::malformed(format!(
                "{:?} at chunk {} is truncated",
                kind,
                offset / CHUNK_BYTES
            )));
        }
        if kind != OpKind::Noop {
            ops.push(decode_operation(&bytes[offset..end])?);
        }
        offset = end;
    }
    Ok(ops)
}

/// Name of the first field where `decoded` and `queued` disagree.
///
/// Decimal fields compare by value, so `"007"` matches `"7"`.
pub fn first_mismatch(decoded: &Operation, queued: &Operation) -> ZkResult<Option<String>> {
    if decoded.kind() != queued.kind() {
        return Ok(Some(format!(
            "kind {:?} != {:?}",
            decoded.kind(),
            queued.kind()
        )));
    }
    let names = schema(decoded.kind());
    for ((name, _), (a, b)) in names
        .iter()
        .zip(op_fields(decoded).iter().zip(op_fields(queued).iter()))
    {
        let equal = match (a, b) {
            (FieldValue::Int(x), FieldValue::Int(y)) => x == y,
            (FieldValue::Dec(x), FieldValue::Dec(y)) => parse_decimal(x)? == parse_decimal(y)?,
            _ => false,
        };
        if !equal {
            return Ok(Some(format!("{} ({:?} != {:?})", name, a, b)));
        }
    }
    Ok(None)
}

/// Move a decimal amount from `from` to `to` decimals of precision.
///
/// Trimming precision requires the trimmed digits to be zero.
pub fn rescale_decimal(amount: &str, from: u32, to: u32) -> ZkResult<String> {
    let value = parse_decimal(amount)?;
    if value.is_zero() {
        return Ok("0".to_string());
    }
    if to >= from {
        let factor = BigUint::from(10u32).pow(to - from);
        return Ok((value * factor).to_string());
    }
    let factor = BigUint::from(10u32).pow(from - to);
    if !(&value % &factor).is_zero() {
        return Err(ZkError::malformed(format!(
            "{} loses precision going from {} to {} decimals",
            amount, from, to
        )));
    }
    Ok((value / factor).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deposit() -> Operation {
        Operation::Deposit(DepositOp {
            account_id: 4,
            token_id: 1,
            amount: "8000000000000000000".into(),
            eth_address: "749586750016394958489396181722318154487364403853".into(),
            layer2_address: "20033022393263117440479548618233787316346227004926545474613580045012802207578".into(),
        })
    }

    fn every_kind() -> Vec<Operation> {
        let ch = [
            "340282366920938463463374607431768211455".to_string(),
            "1".to_string(),
        ];
        vec![
            deposit(),
            Operation::Withdraw(WithdrawOp {
                account_id: 5,
                token_id: 2,
                amount: "123456789".into(),
                eth_address: "1461501637330902918203684832716283019655932542975".into(),
                fee: "2000".into(),
            }),
            Operation::Transfer(TransferOp {
                from_account_id: 4,
                token_id: 1,
                to_account_id: 5,
                amount: "34359738367000000".into(),
                fee: "2047".into(),
            }),
            Operation::TransferToNew(TransferToNewOp {
                from_account_id: 4,
                token_id: 1,
                to_account_id: 6,
                amount: "5".into(),
                eth_address: "7".into(),
                layer2_address: "8".into(),
                fee: "0".into(),
            }),
            Operation::ProxyExit(ProxyExitOp {
                proxy_id: 4,
                target_id: 5,
                token_id: 1,
                amount: "99".into(),
                eth_address: "12".into(),
                fee: "10".into(),
            }),
            Operation::SetPubKey(SetPubKeyOp {
                account_id: 4,
                pub_key_type: 3,
                pub_key: PubKey {
                    x: "13".into(),
                    y: "14".into(),
                },
            }),
            Operation::FullExit(FullExitOp {
                account_id: 4,
                token_id: 1,
                amount: "100".into(),
                eth_address: "12".into(),
                fee: "1".into(),
            }),
            Operation::Swap(SwapOp {
                left_account_id: 4,
                right_account_id: 5,
                left_token_id: 1,
                right_token_id: 2,
                left_deal_amount: "1000".into(),
                right_deal_amount: "3000".into(),
                fee: "3".into(),
            }),
            Operation::ContractToTree(ContractToTreeOp {
                account_id: 4,
                token_id: 1,
                amount: "100000000".into(),
                fee: "0".into(),
            }),
            Operation::ContractToTreeNew(ContractToTreeNewOp {
                to_account_id: 9,
                token_id: 1,
                amount: "100000000".into(),
                eth_address: "1".into(),
                layer2_address: "2".into(),
                fee: "0".into(),
            }),
            Operation::TreeToContract(TreeToContractOp {
                account_id: 4,
                token_id: 1,
                amount: "100000000".into(),
                fee: "1000".into(),
            }),
            Operation::Fee(FeeOp {
                account_id: 1,
                token_id: 1,
                amount: "1000".into(),
            }),
            Operation::MintNft(MintNftOp {
                mint_account_id: 4,
                recipient_id: 5,
                protocol: 1,
                amount: 65535,
                content_hash: ch.clone(),
                fee_token_id: 1,
                fee: "10".into(),
            }),
            Operation::WithdrawNft(WithdrawNftOp {
                from_account_id: 5,
                creator_account_id: 4,
                nft_token_id: 257,
                creator_serial_id: 0,
                protocol: 1,
                init_mint_amount: 10,
                withdraw_amount: 3,
                eth_address: "12".into(),
                content_hash: ch,
                fee_token_id: 1,
                fee: "10".into(),
            }),
            Operation::TransferNft(TransferNftOp {
                from_account_id: 5,
                recipient_id: 4,
                nft_token_id: 257,
                amount: 2,
                fee_token_id: 1,
                fee: "10".into(),
            }),
        ]
    }

    #[test]
    fn test_every_kind_roundtrips() {
        for op in every_kind() {
            let bytes = encode_operation(&op).unwrap();
            assert_eq!(bytes.len(), op.kind().chunks() * CHUNK_BYTES);
            assert_eq!(bytes[0], op.kind().tag());
            assert_eq!(decode_operation(&bytes).unwrap(), op, "{:?}", op.kind());
        }
    }

    #[test]
    fn test_deposit_layout() {
        let bytes = encode_operation(&deposit()).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 4]);
        assert_eq!(&bytes[5..9], &[0, 0, 0, 1]);
        let amount = BigUint::from_bytes_be(&bytes[9..25]);
        assert_eq!(amount.to_string(), "8000000000000000000");
    }

    #[test]
    fn test_packed_roundtrip_and_overflow() {
        for v in ["0", "1", "10", "34359738367", "1000000000000000000", "120000"] {
            let packed = encode_packed(v, PACKED_AMOUNT_MAN_BITS).unwrap();
            assert_eq!(packed.len(), 5);
            assert_eq!(decode_packed(&packed), v);
        }
        // 2^35 has no trailing zeros and needs 36 bits
        assert!(encode_packed("34359738368", PACKED_AMOUNT_MAN_BITS).is_err());
        assert!(encode_packed("2048", PACKED_FEE_MAN_BITS).is_err());
        assert_eq!(decode_packed(&encode_packed("2047", PACKED_FEE_MAN_BITS).unwrap()), "2047");
        // exponent saturates at 31, mantissa keeps the rest
        let big = format!("1{}", "0".repeat(33));
        assert_eq!(decode_packed(&encode_packed(&big, PACKED_AMOUNT_MAN_BITS).unwrap()), big);
    }

    #[test]
    fn test_packed_layout() {
        // 1230 = man 123, exp 1 -> 123 << 5 | 1
        let packed = encode_packed("1230", PACKED_FEE_MAN_BITS).unwrap();
        assert_eq!(u16::from_be_bytes([packed[0], packed[1]]), (123 << 5) | 1);
    }

    #[test]
    fn test_field_overflow_is_error() {
        let mut op = deposit();
        if let Operation::Deposit(d) = &mut op {
            d.account_id = 1 << 32;
        }
        assert!(encode_operation(&op).is_err());

        let transfer = Operation::Transfer(TransferOp {
            from_account_id: 4,
            token_id: 1,
            to_account_id: 5,
            amount: "123456789012345".into(),
            fee: "0".into(),
        });
        assert!(encode_operation(&transfer).is_err());
    }

    #[test]
    fn test_decode_errors() {
        assert!(decode_operation(&[]).is_err());
        let mut bytes = vec![0u8; CHUNK_BYTES];
        bytes[0] = 99;
        assert!(decode_operation(&bytes).is_err());

        let mut bytes = encode_operation(&deposit()).unwrap();
        bytes.pop();
        assert!(decode_operation(&bytes).is_err());

        let mut bytes = encode_operation(&deposit()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] = 1;
        assert!(decode_operation(&bytes).is_err());
    }

    #[test]
    fn test_pubdata_skips_noop() {
        let ops = vec![deposit(), Operation::Noop, every_kind()[2].clone()];
        let pub_datas = encode_pubdata(&ops).unwrap();
        assert_eq!(pub_datas.len(), 3 + 1 + 2);
        let decoded = decode_pubdata(&pub_datas).unwrap();
        assert_eq!(decoded, vec![ops[0].clone(), ops[2].clone()]);
    }

    #[test]
    fn test_pubdata_truncated_and_oversized() {
        let mut pub_datas = encode_pubdata(&[deposit()]).unwrap();
        pub_datas.pop();
        assert!(decode_pubdata(&pub_datas).is_err());

        let too_big = BigUint::from(1u32) << (CHUNK_BYTES * 8);
        assert!(decode_pubdata(&[too_big.to_string()]).is_err());
    }

    #[test]
    fn test_first_mismatch() {
        let a = deposit();
        let mut b = deposit();
        assert_eq!(first_mismatch(&a, &b).unwrap(), None);

        if let Operation::Deposit(d) = &mut b {
            d.amount = "08000000000000000000".into();
        }
        assert_eq!(first_mismatch(&a, &b).unwrap(), None);

        if let Operation::Deposit(d) = &mut b {
            d.token_id = 2;
        }
        let diff = first_mismatch(&a, &b).unwrap().unwrap();
        assert!(diff.starts_with("token_id"));

        let diff = first_mismatch(&a, &Operation::Noop).unwrap().unwrap();
        assert!(diff.starts_with("kind"));
    }

    #[test]
    fn test_rescale_decimal() {
        assert_eq!(rescale_decimal("100000000000", 18, 8).unwrap(), "1");
        assert_eq!(rescale_decimal("1", 8, 18).unwrap(), "10000000000");
        assert_eq!(rescale_decimal("0", 18, 8).unwrap(), "0");
        assert!(rescale_decimal("100000000001", 18, 8).is_err());
    }
}
