// SPDX-License-Identifier: CC0-1.0

//! Template cache for merge-mining work distribution.
//!
//! Merge miners poll for work far more often than the chain moves, so the
//! node keeps the templates it handed out and only rebuilds them when the
//! tip changes or the pending transaction set has moved on. The node
//! itself is reached through [`TemplateSource`]; everything in here is
//! glue around it and holds one mutex for the duration of each call.

use core::fmt;
use std::collections::HashMap;
use std::sync::Mutex;

use log::info;

use crate::auxpow::AuxPow;
use crate::blockdata::block::Block;
use crate::blockdata::script::ScriptBuf;
use crate::consensus::encode::{self, deserialize};
use crate::consensus::Params;
use crate::hash_types::BlockHash;
use crate::pow::{CompactTarget, Target};

/// Seconds after which a template is rebuilt when the mempool changed.
const TEMPLATE_REFRESH_INTERVAL: u64 = 60;

/// How the miner cache reaches the node it serves.
pub trait TemplateSource {
    /// Hash of the current chain tip.
    fn tip_hash(&self) -> BlockHash;
    /// Height the next block would be mined at.
    fn next_height(&self) -> u32;
    /// A counter bumped whenever the set of pending transactions changes.
    fn transactions_updated(&self) -> u32;
    /// Current wall-clock seconds.
    fn now(&self) -> u64;
    /// Assembles a fresh block template paying to `script_pubkey`.
    fn create_block(&self, script_pubkey: &ScriptBuf) -> Option<Block>;
    /// Hands a completed block to the node for validation and relay.
    fn submit_block(&self, block: Block) -> bool;
}

/// Work handed to a merge miner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxBlock {
    /// Hash identifying the template; echoed back on submission.
    pub hash: BlockHash,
    /// This chain's merged-mining identifier.
    pub chain_id: i32,
    /// Hash of the block the template builds on.
    pub previous_block_hash: BlockHash,
    /// Reward of the template's coinbase, in satoshis.
    pub coinbase_value: u64,
    /// The compact target the parent block must meet.
    pub bits: CompactTarget,
    /// Height of the block being mined.
    pub height: u32,
    /// The expanded target, for miners that want it precomputed.
    pub target: Target,
}

/// Errors surfaced by the merge-mining calls.
#[derive(Debug)]
pub enum MinerError {
    /// Merge mining is not yet active at the current height.
    AuxpowNotActive,
    /// The node could not assemble a block template.
    TemplateFailed,
    /// The template's coinbase has no spendable output.
    BadTemplateCoinbase,
    /// The template carries an unusable compact target.
    InvalidTemplateBits,
    /// No cached template matches the submitted hash.
    UnknownBlockHash,
    /// The submitted auxpow bytes did not decode.
    BadAuxPowData(encode::Error),
}

impl fmt::Display for MinerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MinerError::AuxpowNotActive => {
                write!(f, "merge mining is not yet available at this height")
            }
            MinerError::TemplateFailed => write!(f, "failed to assemble a block template"),
            MinerError::BadTemplateCoinbase => write!(f, "constructed block has invalid coinbase"),
            MinerError::InvalidTemplateBits => write!(f, "invalid difficulty bits in block"),
            MinerError::UnknownBlockHash => write!(f, "block hash unknown"),
            MinerError::BadAuxPowData(ref e) => write!(f, "invalid auxpow data: {}", e),
        }
    }
}

impl std::error::Error for MinerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            MinerError::BadAuxPowData(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Errors if merge mining is not allowed at `height`.
pub fn ensure_auxpow_active(height: u32, params: &Params) -> Result<(), MinerError> {
    if height < params.auxpow_start_height {
        return Err(MinerError::AuxpowNotActive);
    }
    Ok(())
}

#[derive(Default)]
struct MinerState {
    /// Templates handed out since the last tip change.
    templates: Vec<Block>,
    /// Maps template hashes to entries in `templates`.
    blocks: HashMap<BlockHash, usize>,
    /// Maps payout scripts to the template currently served for them.
    current: HashMap<ScriptBuf, usize>,
    tip: Option<BlockHash>,
    height: u32,
    tx_updated_last: u32,
    start_time: u64,
}

/// Manages block templates for the merge-mining calls.
#[derive(Default)]
pub struct AuxpowMiner {
    state: Mutex<MinerState>,
}

impl AuxpowMiner {
    /// Creates an empty template cache.
    pub fn new() -> Self { Self::default() }

    /// Returns work for a merge miner paying to `script_pubkey`.
    ///
    /// The same template is served until the tip moves, or the pending
    /// transaction set changes and the template has been out for a while.
    pub fn create_aux_block<S: TemplateSource>(
        &self,
        source: &S,
        script_pubkey: &ScriptBuf,
        params: &Params,
    ) -> Result<AuxBlock, MinerError> {
        ensure_auxpow_active(source.next_height(), params)?;
        let mut state = self.state.lock().expect("miner mutex poisoned");

        let tip = source.tip_hash();
        let tx_updated = source.transactions_updated();
        let now = source.now();

        let mut index = state.current.get(script_pubkey).copied();
        let stale = match index {
            None => true,
            Some(_) => {
                state.tip != Some(tip)
                    || (tx_updated != state.tx_updated_last
                        && now.saturating_sub(state.start_time) > TEMPLATE_REFRESH_INTERVAL)
            }
        };

        if stale {
            if state.tip != Some(tip) {
                state.templates.clear();
                state.blocks.clear();
                state.current.clear();
            }

            let mut block =
                source.create_block(script_pubkey).ok_or(MinerError::TemplateFailed)?;
            if !block.header.version.is_auxpow() || block.header.auxpow.is_none() {
                AuxPow::init(&mut block.header);
            }

            state.tip = Some(tip);
            state.height = source.next_height();
            state.tx_updated_last = tx_updated;
            state.start_time = now;

            let slot = state.templates.len();
            state.blocks.insert(block.block_hash(), slot);
            state.current.insert(script_pubkey.clone(), slot);
            info!("new merge-mining template {} at height {}", block.block_hash(), state.height);
            state.templates.push(block);
            index = Some(slot);
        }

        let block = &state.templates[index.expect("template ensured above")];

        let (target, negative, overflow) = Target::from_compact_with_flags(block.header.bits);
        if negative || overflow || target == Target::ZERO {
            return Err(MinerError::InvalidTemplateBits);
        }

        let coinbase_value = block
            .txdata
            .first()
            .and_then(|tx| tx.output.first())
            .map(|out| out.value)
            .ok_or(MinerError::BadTemplateCoinbase)?;

        Ok(AuxBlock {
            hash: block.block_hash(),
            chain_id: block.header.version.chain_id(),
            previous_block_hash: block.header.prev_blockhash,
            coinbase_value,
            bits: block.header.bits,
            height: state.height,
            target,
        })
    }

    /// Accepts a solved template: attaches the submitted proof and hands
    /// the block to the node.
    pub fn submit_aux_block<S: TemplateSource>(
        &self,
        source: &S,
        hash: BlockHash,
        auxpow_bytes: &[u8],
        params: &Params,
    ) -> Result<bool, MinerError> {
        ensure_auxpow_active(source.next_height(), params)?;

        let mut block = {
            let state = self.state.lock().expect("miner mutex poisoned");
            let slot = *state.blocks.get(&hash).ok_or(MinerError::UnknownBlockHash)?;
            state.templates[slot].clone()
        };

        let auxpow: AuxPow = deserialize(auxpow_bytes).map_err(MinerError::BadAuxPowData)?;
        block.header.auxpow = Some(auxpow);
        debug_assert_eq!(block.block_hash(), hash);

        Ok(source.submit_block(block))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use hashes::Hash;

    use super::*;
    use crate::blockdata::block::{Header, Version};
    use crate::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut, SEQUENCE_FINAL};
    use crate::consensus::params::Network;
    use crate::consensus::serialize;
    use crate::hash_types::TxMerkleNode;

    struct MockSource {
        tip: Cell<BlockHash>,
        height: Cell<u32>,
        tx_counter: Cell<u32>,
        now: Cell<u64>,
        assembled: Cell<u32>,
        submitted: RefCell<Vec<Block>>,
    }

    impl MockSource {
        fn new(height: u32) -> Self {
            MockSource {
                tip: Cell::new(BlockHash::hash(b"tip")),
                height: Cell::new(height),
                tx_counter: Cell::new(0),
                now: Cell::new(100_000),
                assembled: Cell::new(0),
                submitted: RefCell::new(Vec::new()),
            }
        }
    }

    impl TemplateSource for MockSource {
        fn tip_hash(&self) -> BlockHash { self.tip.get() }
        fn next_height(&self) -> u32 { self.height.get() }
        fn transactions_updated(&self) -> u32 { self.tx_counter.get() }
        fn now(&self) -> u64 { self.now.get() }

        fn create_block(&self, script_pubkey: &ScriptBuf) -> Option<Block> {
            self.assembled.set(self.assembled.get() + 1);
            let mut script_sig = ScriptBuf::new();
            script_sig.push_slice(&self.assembled.get().to_le_bytes());
            let coinbase = Transaction {
                version: 1,
                input: vec![TxIn {
                    previous_output: OutPoint::null(),
                    script_sig,
                    sequence: SEQUENCE_FINAL,
                }],
                output: vec![TxOut { value: 50_0000_0000, script_pubkey: script_pubkey.clone() }],
                lock_time: 0,
            };
            let header = Header {
                version: Version::from_parts(4, 0x20),
                prev_blockhash: self.tip.get(),
                merkle_root: TxMerkleNode::from_raw_hash(coinbase.txid().to_raw_hash()),
                time: 1_700_000_000,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
                auxpow: None,
            };
            Some(Block { header, txdata: vec![coinbase] })
        }

        fn submit_block(&self, block: Block) -> bool {
            self.submitted.borrow_mut().push(block);
            true
        }
    }

    fn payout_script(tag: &[u8]) -> ScriptBuf {
        let mut script = ScriptBuf::new();
        script.push_slice(tag);
        script
    }

    #[test]
    fn height_gate() {
        let params = Params::new(Network::Mainnet);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(params.auxpow_start_height - 1);
        assert!(matches!(
            miner.create_aux_block(&source, &payout_script(b"a"), &params),
            Err(MinerError::AuxpowNotActive)
        ));
    }

    #[test]
    fn template_is_cached_per_script() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        let script = payout_script(b"a");

        let first = miner.create_aux_block(&source, &script, &params).unwrap();
        let second = miner.create_aux_block(&source, &script, &params).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.assembled.get(), 1);
        assert_eq!(first.chain_id, 0x20);
        assert_eq!(first.height, 10);
        assert_eq!(first.target, Target::from_compact(first.bits));

        // A different payout script gets its own template.
        miner.create_aux_block(&source, &payout_script(b"b"), &params).unwrap();
        assert_eq!(source.assembled.get(), 2);
    }

    #[test]
    fn tip_change_flushes_cache() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        let script = payout_script(b"a");

        let first = miner.create_aux_block(&source, &script, &params).unwrap();
        source.tip.set(BlockHash::hash(b"next tip"));
        source.height.set(11);
        let second = miner.create_aux_block(&source, &script, &params).unwrap();

        assert_ne!(first.hash, second.hash);
        assert_eq!(second.height, 11);
        assert_eq!(source.assembled.get(), 2);

        // The flushed template is gone from the submission index.
        assert!(matches!(
            miner.submit_aux_block(&source, first.hash, &[], &params),
            Err(MinerError::UnknownBlockHash)
        ));
    }

    #[test]
    fn mempool_churn_refreshes_after_interval() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        let script = payout_script(b"a");

        let first = miner.create_aux_block(&source, &script, &params).unwrap();

        // Churn alone is not enough.
        source.tx_counter.set(5);
        let second = miner.create_aux_block(&source, &script, &params).unwrap();
        assert_eq!(first, second);

        // Churn plus an elapsed refresh interval rebuilds.
        source.now.set(source.now.get() + TEMPLATE_REFRESH_INTERVAL + 1);
        let third = miner.create_aux_block(&source, &script, &params).unwrap();
        assert_ne!(first.hash, third.hash);
    }

    #[test]
    fn submit_unknown_hash() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        assert!(matches!(
            miner.submit_aux_block(&source, BlockHash::hash(b"nope"), &[], &params),
            Err(MinerError::UnknownBlockHash)
        ));
    }

    #[test]
    fn create_solve_submit_cycle() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        let script = payout_script(b"a");

        let work = miner.create_aux_block(&source, &script, &params).unwrap();

        // Rebuild the solving proof exactly as an external merge miner
        // would: commit to the child hash in a fresh parent coinbase.
        let child = {
            let state = miner.state.lock().unwrap();
            let slot = state.blocks[&work.hash];
            state.templates[slot].header.pure_header()
        };
        let auxpow = AuxPow::create(&child);
        let bytes = serialize(&auxpow);

        assert!(miner.submit_aux_block(&source, work.hash, &bytes, &params).unwrap());

        let submitted = source.submitted.borrow();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].block_hash(), work.hash);
        let attached = submitted[0].header.auxpow.as_ref().unwrap();
        attached
            .check(work.hash, submitted[0].header.version.chain_id(), &params)
            .unwrap();
    }

    #[test]
    fn garbage_auxpow_rejected() {
        let params = Params::new(Network::Regtest);
        let miner = AuxpowMiner::new();
        let source = MockSource::new(10);
        let work = miner.create_aux_block(&source, &payout_script(b"a"), &params).unwrap();

        assert!(matches!(
            miner.submit_aux_block(&source, work.hash, &[0xde, 0xad], &params),
            Err(MinerError::BadAuxPowData(_))
        ));
    }
}
