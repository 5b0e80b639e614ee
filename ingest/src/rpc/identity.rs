use alloy::primitives::{address, Address, Bytes};
use clap::ValueEnum;

use super::{decode, decode_quantity, BatchRpc, RpcCall, RpcError, RpcTransport};

/// Precompile answering the chain's warp blockchain id.
const WARP_PRECOMPILE: Address = address!("0200000000000000000000000000000000000005");
/// Selector of `getBlockchainID()`.
const GET_BLOCKCHAIN_ID: [u8; 4] = [0x42, 0x13, 0xcf, 0x78];

/// How the node's chain is identified at startup. The value is only logged
/// and compared against the expected identity when one is configured.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChainIdentity {
    /// Decimal `eth_chainId`.
    #[default]
    ChainId,
    /// Hex blockchain id returned by the warp precompile.
    WarpPrecompile,
}

impl ChainIdentity {
    pub fn call(&self) -> RpcCall {
        match self {
            ChainIdentity::ChainId => RpcCall::ChainId,
            ChainIdentity::WarpPrecompile => RpcCall::Call {
                to: WARP_PRECOMPILE,
                data: Bytes::from_static(&GET_BLOCKCHAIN_ID),
            },
        }
    }

    /// Turns the raw result of [`Self::call`] into the identity string.
    pub fn parse(&self, value: serde_json::Value) -> Result<String, RpcError> {
        match self {
            ChainIdentity::ChainId => Ok(decode_quantity("eth_chainId", value)?.to_string()),
            ChainIdentity::WarpPrecompile => {
                let id: Bytes = decode("eth_call", value)?;
                Ok(alloy::hex::encode_prefixed(id))
            }
        }
    }

    pub async fn identify<T: RpcTransport>(&self, rpc: &BatchRpc<T>) -> Result<String, RpcError> {
        let value = rpc.call(self.call()).await?;
        self.parse(value)
    }
}
