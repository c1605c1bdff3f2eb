//! Requests that do not change the channel bookkeeping.

use tracing::warn;

use super::Client;
use crate::{
    channel::{Asset, SignedState},
    config::{EthereumAssetType, DEFAULT_SOLANA_DECIMALS, ETH_DECIMALS},
    message::{
        ChainInfo, ChannelInfo, ChannelState, GetAssets, GetAssetsResponse, GetBalance,
        GetBalanceResponse, GetChainsResponse, GetChannelInfo, GetDecimals, GetDecimalsResponse,
        GetFunds, GetFundsResponse, GetHubBalance, GetQuote, GetSignedState, GetTimeout,
        GetTimeoutResponse, Message,
    },
    wire::ConnectionError,
};

impl Client {
    pub(super) fn get_channel_info(&self, req: GetChannelInfo) -> Message {
        let Some(ch) = self.channel(&req.id) else {
            return Message::error("channel not found");
        };
        let params = ch.params();
        let peer = &params.participants[1 - ch.idx()];
        Message::ChannelInfo(ChannelInfo {
            peer_address_eth: peer.eth.unwrap_or_default(),
            peer_address_sol: peer.sol.clone().unwrap_or_default(),
            state: ChannelState::new(&ch.state(), ch.idx()),
        })
    }

    pub(super) fn get_signed_state(&self, req: GetSignedState) -> Message {
        match self.channel(&req.id) {
            Some(ch) => Message::SignedState(ch.signed_state()),
            None => Message::error("channel not found"),
        }
    }

    pub(super) fn send_signed_state(&self, state: SignedState) -> Message {
        if state.is_complete() {
            Message::success()
        } else {
            Message::error("incomplete signed state")
        }
    }

    pub(super) fn get_chains(&self) -> Message {
        let config = &self.ctx.config;
        let eth = config.ethereum.iter().map(|c| ChainInfo {
            name: c.name.clone(),
            id: c.chain_id,
        });
        let sol = config.solana.iter().map(|c| ChainInfo {
            name: c.name.clone(),
            id: c.chain_id,
        });
        Message::GetChainsResponse(GetChainsResponse {
            chains: eth.chain(sol).collect(),
        })
    }

    pub(super) fn get_assets(&self, req: GetAssets) -> Message {
        let config = &self.ctx.config;
        let ethereum_assets = config
            .ethereum
            .iter()
            .filter(|c| req.chain_ids.contains(&c.chain_id))
            .flat_map(|c| c.assets.iter().cloned())
            .collect();
        let solana_assets = config
            .solana
            .iter()
            .filter(|c| req.chain_ids.contains(&c.chain_id))
            .flat_map(|c| c.assets.iter().cloned())
            .collect();
        Message::GetAssetsResponse(GetAssetsResponse {
            ethereum_assets,
            solana_assets,
        })
    }

    pub(super) async fn get_decimals(&self, req: GetDecimals) -> Message {
        let config = &self.ctx.config;
        let decimals = match &req.asset {
            Asset::Ethereum { holder, chain_id } => {
                let Some(asset) = config.eth_asset(chain_id, holder) else {
                    return Message::error("asset not found");
                };
                match asset.asset_type {
                    EthereumAssetType::Eth => ETH_DECIMALS,
                    EthereumAssetType::Erc20 => {
                        match self.ctx.ledger.token_decimals(chain_id, &asset.address).await {
                            Ok(decimals) => decimals,
                            Err(err) => {
                                warn!(%err, token = %asset.address, "reading token decimals");
                                return Message::error("could not fetch the decimals for the asset");
                            }
                        }
                    }
                }
            }
            Asset::Solana { mint } => config
                .sol_asset(mint)
                .and_then(|a| a.decimals)
                .unwrap_or(DEFAULT_SOLANA_DECIMALS),
        };
        Message::GetDecimalsResponse(GetDecimalsResponse { decimals })
    }

    pub(super) fn get_timeout(&self, req: GetTimeout) -> Message {
        let timeout = self.ctx.config.timeouts.get(req.timeout_type);
        Message::GetTimeoutResponse(GetTimeoutResponse {
            timeout: timeout.as_secs(),
        })
    }

    pub(super) async fn get_balance(&self, req: GetBalance) -> Message {
        match self.ctx.ledger.balance(&req.asset, &self.participant).await {
            Ok(balance) => Message::GetBalanceResponse(GetBalanceResponse { balance }),
            Err(err) => {
                warn!(%err, "reading balance");
                Message::error("could not get balance")
            }
        }
    }

    pub(super) fn get_funds(&self, _req: GetFunds) -> Message {
        Message::GetFundsResponse(GetFundsResponse { success: false })
    }

    pub(super) async fn get_quote(&self, req: GetQuote) -> Message {
        let hub = req.hub.clone();
        self.forward(&hub, Message::GetQuote(req), |m| {
            matches!(m, Message::GetQuoteResponse(_))
        })
        .await
    }

    pub(super) async fn get_hub_balance(&self, req: GetHubBalance) -> Message {
        let hub = req.hub.clone();
        self.forward(&hub, Message::GetHubBalance(req), |m| {
            matches!(m, Message::GetBalanceResponse(_))
        })
        .await
    }

    /// Ask the participant registered as `hub` and relay its answer.
    async fn forward(&self, hub: &str, msg: Message, expected: fn(&Message) -> bool) -> Message {
        let Some(hub) = self.ctx.registry.get(hub) else {
            return Message::error("hub not found");
        };
        let kind = msg.kind();
        let timeout = self.ctx.config.timeouts.default;
        match hub.conn().request_timeout(msg, timeout, "hub").await {
            Ok(resp) if expected(&resp) => resp,
            Ok(Message::Error(err)) => Message::Error(err),
            Ok(other) => {
                warn!(kind, got = other.kind(), "unexpected answer from hub");
                Message::error("hub did not answer the request properly")
            }
            Err(ConnectionError::Timeout(_)) => Message::error("hub did not answer in time"),
            Err(err) => {
                warn!(kind, %err, "forwarding to hub");
                Message::error("forwarding request to hub failed")
            }
        }
    }
}
