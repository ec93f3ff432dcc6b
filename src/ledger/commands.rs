//! Typed constructors for the ledger commands the trading core submits.
//!
//! Side values cross the wire upper-case (`YES`/`NO`); decimals cross as
//! strings. Translation happens here and nowhere else.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::ledger::LedgerCommand;
use crate::models::{Side, TradeType};

pub const TEMPLATE_TRADING_ACCOUNT: &str = "TradingAccount";
pub const TEMPLATE_POSITION: &str = "Position";
pub const TEMPLATE_MARKET: &str = "Market";
pub const TEMPLATE_SETTLEMENT_PROPOSAL: &str = "SettlementProposal";
pub const TEMPLATE_SETTLEMENT_PROPOSAL_ACCEPTED: &str = "SettlementProposalAccepted";
pub const TEMPLATE_SETTLEMENT: &str = "Settlement";

pub const CHOICE_LOCK_FUNDS: &str = "LockFunds";
pub const CHOICE_UNLOCK_FUNDS: &str = "UnlockFunds";
pub const CHOICE_LOCK_POSITION: &str = "LockPosition";
pub const CHOICE_UNLOCK_POSITION: &str = "UnlockPosition";
pub const CHOICE_BUYER_ACCEPT: &str = "BuyerAccept";
pub const CHOICE_SELLER_ACCEPT: &str = "SellerAccept";
pub const CHOICE_EXECUTE_SETTLEMENT: &str = "ExecuteSettlement";

fn dec(value: Decimal) -> String {
    value.to_string()
}

pub fn lock_funds(account_cid: &str, amount: Decimal, order_id: Uuid) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_TRADING_ACCOUNT.to_string(),
        contract_id: account_cid.to_string(),
        choice: CHOICE_LOCK_FUNDS.to_string(),
        argument: json!({ "amount": dec(amount), "orderId": order_id.to_string() }),
    }
}

pub fn unlock_funds(account_cid: &str, amount: Decimal, order_id: Uuid) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_TRADING_ACCOUNT.to_string(),
        contract_id: account_cid.to_string(),
        choice: CHOICE_UNLOCK_FUNDS.to_string(),
        argument: json!({ "amount": dec(amount), "orderId": order_id.to_string() }),
    }
}

pub fn lock_position(position_cid: &str, lock_quantity: Decimal, order_id: Uuid) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_POSITION.to_string(),
        contract_id: position_cid.to_string(),
        choice: CHOICE_LOCK_POSITION.to_string(),
        argument: json!({ "lockQuantity": dec(lock_quantity), "orderId": order_id.to_string() }),
    }
}

pub fn unlock_position(
    position_cid: &str,
    unlock_quantity: Decimal,
    order_id: Uuid,
) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_POSITION.to_string(),
        contract_id: position_cid.to_string(),
        choice: CHOICE_UNLOCK_POSITION.to_string(),
        argument: json!({
            "unlockQuantity": dec(unlock_quantity),
            "orderId": order_id.to_string()
        }),
    }
}

/// Arguments for the settlement proposal create command.
#[derive(Debug, Clone)]
pub struct SettlementProposalArgs {
    pub buyer: String,
    pub seller: String,
    pub market_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub proposal_id: Uuid,
    pub trade_type: TradeType,
    pub market_contract_id: String,
    pub seller_position_locked_quantity: Option<Decimal>,
}

pub fn create_settlement_proposal(args: &SettlementProposalArgs) -> LedgerCommand {
    let trade_type = match args.trade_type {
        TradeType::ShareTrade => "shareTrade",
        TradeType::ShareCreation => "shareCreation",
    };

    LedgerCommand::Create {
        template_id: TEMPLATE_SETTLEMENT_PROPOSAL.to_string(),
        payload: json!({
            "buyer": args.buyer,
            "seller": args.seller,
            "marketId": args.market_id,
            "side": args.side.wire(),
            "quantity": dec(args.quantity),
            "price": dec(args.price),
            "proposalId": args.proposal_id.to_string(),
            "tradeType": trade_type,
            "marketContractId": args.market_contract_id,
            "sellerPositionLockedQuantity":
                args.seller_position_locked_quantity.map(dec),
        }),
    }
}

pub fn buyer_accept(proposal_cid: &str) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_SETTLEMENT_PROPOSAL.to_string(),
        contract_id: proposal_cid.to_string(),
        choice: CHOICE_BUYER_ACCEPT.to_string(),
        argument: json!({}),
    }
}

pub fn seller_accept(accepted_cid: &str) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_SETTLEMENT_PROPOSAL_ACCEPTED.to_string(),
        contract_id: accepted_cid.to_string(),
        choice: CHOICE_SELLER_ACCEPT.to_string(),
        argument: json!({}),
    }
}

/// Contract references resolved immediately before each execution round.
#[derive(Debug, Clone)]
pub struct ExecuteSettlementArgs {
    pub buyer_account_cid: String,
    pub seller_account_cid: String,
    pub buyer_position_cid: Option<String>,
    pub seller_position_cid: Option<String>,
}

pub fn execute_settlement(settlement_cid: &str, args: &ExecuteSettlementArgs) -> LedgerCommand {
    LedgerCommand::Exercise {
        template_id: TEMPLATE_SETTLEMENT.to_string(),
        contract_id: settlement_cid.to_string(),
        choice: CHOICE_EXECUTE_SETTLEMENT.to_string(),
        argument: json!({
            "buyerAccountCid": args.buyer_account_cid,
            "sellerAccountCid": args.seller_account_cid,
            "buyerPositionCid": args.buyer_position_cid,
            "sellerPositionCid": args.seller_position_cid,
        }),
    }
}

// ============================================================================
// Wire payloads
// ============================================================================

/// `TradingAccount` contract payload as reported by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingAccountPayload {
    pub owner: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked_balance: Decimal,
}

/// `Position` contract payload as reported by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPayload {
    pub owner: String,
    pub market_id: String,
    /// Wire-format side, upper-case.
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked_quantity: Decimal,
}

impl PositionPayload {
    pub fn side(&self) -> Option<Side> {
        Side::from_wire(&self.side)
    }
}

/// `Market` contract payload, as much of it as the core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPayload {
    pub market_id: String,
    pub status: String,
}

impl MarketPayload {
    pub fn is_open(&self) -> bool {
        self.status.eq_ignore_ascii_case("open")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_lock_funds_carries_decimal_string() {
        let order_id = Uuid::new_v4();
        let cmd = lock_funds("cid-1", dec!(49.50), order_id);
        match cmd {
            LedgerCommand::Exercise {
                template_id,
                contract_id,
                choice,
                argument,
            } => {
                assert_eq!(template_id, TEMPLATE_TRADING_ACCOUNT);
                assert_eq!(contract_id, "cid-1");
                assert_eq!(choice, CHOICE_LOCK_FUNDS);
                assert_eq!(argument["amount"], "49.50");
                assert_eq!(argument["orderId"], order_id.to_string());
            }
            _ => panic!("expected exercise command"),
        }
    }

    #[test]
    fn test_proposal_side_is_upper_case_on_wire() {
        let args = SettlementProposalArgs {
            buyer: "alice::party".into(),
            seller: "bob::party".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            quantity: dec!(100),
            price: dec!(0.40),
            proposal_id: Uuid::new_v4(),
            trade_type: TradeType::ShareCreation,
            market_contract_id: "cid-market".into(),
            seller_position_locked_quantity: None,
        };
        match create_settlement_proposal(&args) {
            LedgerCommand::Create { payload, .. } => {
                assert_eq!(payload["side"], "YES");
                assert_eq!(payload["tradeType"], "shareCreation");
                assert_eq!(payload["sellerPositionLockedQuantity"], serde_json::Value::Null);
            }
            _ => panic!("expected create command"),
        }
    }

    #[test]
    fn test_trading_account_payload_decodes_decimal_strings() {
        let payload: TradingAccountPayload = serde_json::from_value(serde_json::json!({
            "owner": "alice::party",
            "availableBalance": "100.25",
            "lockedBalance": "0"
        }))
        .unwrap();
        assert_eq!(payload.available_balance, dec!(100.25));
        assert_eq!(payload.locked_balance, dec!(0));
    }
}
