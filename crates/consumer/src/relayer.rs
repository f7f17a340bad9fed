//! Signed on-chain writes: root updates, request processing, withdrawals.
//!
//! The [`RelayerClient`] capability hides the wallet plumbing so the ledger
//! and Merkle engine can be driven by recording mocks in tests. The
//! production client serializes writes per chain to avoid nonce races.

use std::collections::HashMap;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::SolValue;
use alloy_primitives::{Address, Bytes, B256, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vaultbridge_core::TokenId;

use crate::config::RelayerChainConfig;

// Relayer entry-point bindings. The same contract carries the ownership
// root, request processing, and the vault withdraw path.
sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract OwnershipRelayer {
        function updateNFTOwnershipRoot(bytes32 newRoot) external;
        function processRequest(bytes32 requestId, bool approved) external;
        function completeWithdraw(
            address handler,
            bytes32 requestId,
            bytes32[] proof,
            bytes additionalData
        ) external;
    }

    #[allow(missing_docs)]
    #[sol(rpc)]
    contract LendingPoolView {
        function utilization(uint256 tokenId) external view returns (uint256);
    }
}

// Type alias for the Alloy provider with wallet support
// This complex type is necessary until Alloy provides a simpler abstraction
type WalletProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::fillers::JoinFill<
            alloy::providers::Identity,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::GasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::BlobGasFiller,
                    alloy::providers::fillers::JoinFill<
                        alloy::providers::fillers::NonceFiller,
                        alloy::providers::fillers::ChainIdFiller,
                    >,
                >,
            >,
        >,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    alloy::providers::RootProvider<alloy::transports::http::Http<alloy::transports::http::Client>>,
    alloy::transports::http::Http<alloy::transports::http::Client>,
    alloy::network::Ethereum,
>;

/// ABI-encode the asset address for `completeWithdraw`'s additional data.
pub fn encode_asset(asset: &Address) -> Bytes {
    Bytes::from(asset.abi_encode())
}

/// Capability: signed relayer writes.
#[async_trait]
pub trait RelayerClient: Send + Sync {
    /// Push a new ownership root to the chain's relayer contract.
    async fn submit_root(&self, chain_id: u64, root: B256) -> Result<()>;

    /// Approve or reject a collateral request on chain.
    async fn process_request(&self, chain_id: u64, request_id: B256, approved: bool) -> Result<()>;

    /// Complete a validated withdrawal on the vault entry point.
    async fn complete_withdraw(
        &self,
        chain_id: u64,
        handler: Address,
        request_id: B256,
        proof: Vec<B256>,
        additional_data: Bytes,
    ) -> Result<()>;
}

/// Capability: lending-pool utilization reads (1e6 fixed point).
#[async_trait]
pub trait LendingPool: Send + Sync {
    /// Outstanding utilization for a position at one protocol, scaled by
    /// [`vaultbridge_core::UTILIZATION_SCALE`].
    async fn utilization(&self, chain_id: u64, protocol: Address, token_id: &TokenId)
        -> Result<u64>;
}

struct ChainRelayer {
    provider: WalletProvider,
    relayer_address: Address,
    /// Writes on one chain go through this lock to keep nonces ordered.
    write_lock: Mutex<()>,
}

/// Production relayer client over wallet-filled alloy providers.
pub struct OnChainRelayerClient {
    chains: HashMap<u64, Arc<ChainRelayer>>,
}

impl OnChainRelayerClient {
    /// Connect one wallet-backed provider per configured chain.
    pub fn connect(configs: &[RelayerChainConfig], signer: PrivateKeySigner) -> Result<Self> {
        let wallet = EthereumWallet::from(signer);
        let mut chains = HashMap::new();

        for config in configs {
            let url = config
                .rpc_url
                .parse()
                .with_context(|| format!("Invalid relayer RPC URL: {}", config.rpc_url))?;

            let provider = ProviderBuilder::new()
                .with_recommended_fillers()
                .wallet(wallet.clone())
                .on_http(url);

            chains.insert(
                config.chain_id,
                Arc::new(ChainRelayer {
                    provider,
                    relayer_address: config.relayer_address,
                    write_lock: Mutex::new(()),
                }),
            );
        }

        Ok(Self { chains })
    }

    fn chain(&self, chain_id: u64) -> Result<&Arc<ChainRelayer>> {
        self.chains
            .get(&chain_id)
            .ok_or_else(|| anyhow::anyhow!("No relayer configured for chain {chain_id}"))
    }
}

#[async_trait]
impl RelayerClient for OnChainRelayerClient {
    async fn submit_root(&self, chain_id: u64, root: B256) -> Result<()> {
        let chain = self.chain(chain_id)?;
        let _guard = chain.write_lock.lock().await;

        let contract = OwnershipRelayer::new(chain.relayer_address, chain.provider.clone());
        let tx = contract
            .updateNFTOwnershipRoot(root)
            .send()
            .await
            .context("Failed to send updateNFTOwnershipRoot")?;

        let receipt = tx
            .get_receipt()
            .await
            .context("Failed to get updateNFTOwnershipRoot receipt")?;
        if !receipt.status() {
            anyhow::bail!(
                "updateNFTOwnershipRoot reverted on chain {chain_id}: 0x{}",
                hex::encode(receipt.transaction_hash)
            );
        }

        info!(
            chain_id,
            root = %root,
            tx = %receipt.transaction_hash,
            "Ownership root updated"
        );
        Ok(())
    }

    async fn process_request(&self, chain_id: u64, request_id: B256, approved: bool) -> Result<()> {
        let chain = self.chain(chain_id)?;
        let _guard = chain.write_lock.lock().await;

        let contract = OwnershipRelayer::new(chain.relayer_address, chain.provider.clone());
        let tx = contract
            .processRequest(request_id, approved)
            .send()
            .await
            .context("Failed to send processRequest")?;

        let receipt = tx
            .get_receipt()
            .await
            .context("Failed to get processRequest receipt")?;
        if !receipt.status() {
            anyhow::bail!(
                "processRequest reverted on chain {chain_id}: 0x{}",
                hex::encode(receipt.transaction_hash)
            );
        }

        info!(
            chain_id,
            request_id = %request_id,
            approved,
            tx = %receipt.transaction_hash,
            "Request processed"
        );
        Ok(())
    }

    async fn complete_withdraw(
        &self,
        chain_id: u64,
        handler: Address,
        request_id: B256,
        proof: Vec<B256>,
        additional_data: Bytes,
    ) -> Result<()> {
        let chain = self.chain(chain_id)?;
        let _guard = chain.write_lock.lock().await;

        let contract = OwnershipRelayer::new(chain.relayer_address, chain.provider.clone());
        let tx = contract
            .completeWithdraw(handler, request_id, proof, additional_data)
            .send()
            .await
            .context("Failed to send completeWithdraw")?;

        let receipt = tx
            .get_receipt()
            .await
            .context("Failed to get completeWithdraw receipt")?;
        if !receipt.status() {
            warn!(
                chain_id,
                request_id = %request_id,
                tx = %receipt.transaction_hash,
                "completeWithdraw reverted"
            );
            anyhow::bail!("completeWithdraw reverted on chain {chain_id}");
        }

        info!(
            chain_id,
            request_id = %request_id,
            tx = %receipt.transaction_hash,
            "Withdrawal completed on chain"
        );
        Ok(())
    }
}

/// Lending-pool utilization over plain read providers.
pub struct OnChainLendingPool {
    providers: HashMap<u64, WalletProvider>,
}

impl OnChainLendingPool {
    /// Reuse the relayer chain configuration for view calls.
    pub fn connect(configs: &[RelayerChainConfig], signer: PrivateKeySigner) -> Result<Self> {
        let wallet = EthereumWallet::from(signer);
        let mut providers = HashMap::new();

        for config in configs {
            let url = config
                .rpc_url
                .parse()
                .with_context(|| format!("Invalid relayer RPC URL: {}", config.rpc_url))?;
            let provider = ProviderBuilder::new()
                .with_recommended_fillers()
                .wallet(wallet.clone())
                .on_http(url);
            providers.insert(config.chain_id, provider);
        }

        Ok(Self { providers })
    }
}

#[async_trait]
impl LendingPool for OnChainLendingPool {
    async fn utilization(
        &self,
        chain_id: u64,
        protocol: Address,
        token_id: &TokenId,
    ) -> Result<u64> {
        let provider = self
            .providers
            .get(&chain_id)
            .ok_or_else(|| anyhow::anyhow!("No provider configured for chain {chain_id}"))?;

        let contract = LendingPoolView::new(protocol, provider.clone());
        let result = contract
            .utilization(*token_id.inner())
            .call()
            .await
            .with_context(|| format!("utilization({token_id}) failed at {protocol}"))?;

        let raw: U256 = result._0;
        raw.try_into()
            .map_err(|_| anyhow::anyhow!("Utilization out of range: {raw}"))
    }
}
