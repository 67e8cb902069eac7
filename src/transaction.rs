use serde::{Deserialize, Serialize};

use crate::block::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractKind {
    Transfer,
    TransferAsset,
    Vote,
    Freeze,
    CreateSmartContract,
    TriggerSmartContract,
}

impl ContractKind {
    /// Kinds that need the contract VM; these are isolated by the dispatcher.
    pub fn invokes_vm(self) -> bool {
        matches!(self, ContractKind::CreateSmartContract | ContractKind::TriggerSmartContract)
    }

    fn tag(self) -> u8 {
        match self {
            ContractKind::Transfer => 1,
            ContractKind::TransferAsset => 2,
            ContractKind::Vote => 4,
            ContractKind::Freeze => 11,
            ContractKind::CreateSmartContract => 30,
            ContractKind::TriggerSmartContract => 31,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub contract: ContractKind,
    pub owner: [u8; 32],
    pub payload: Vec<u8>,
    pub nonce: u64,
    pub expiration_ms: u64,
}

impl Transaction {
    pub fn new(contract: ContractKind, owner: [u8; 32], payload: Vec<u8>, nonce: u64, expiration_ms: u64) -> Self {
        Self { contract, owner, payload, nonce, expiration_ms }
    }

    pub fn id(&self) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.contract.tag()]);
        hasher.update(&self.owner);
        hasher.update(&(self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.update(&self.nonce.to_le_bytes());
        hasher.update(&self.expiration_ms.to_le_bytes());
        *hasher.finalize().as_bytes()
    }
}
