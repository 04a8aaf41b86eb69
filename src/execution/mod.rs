// Order routing, order records and positions
pub mod ledger;

pub use ledger::{
    LedgerAction, LedgerDecision, LedgerPolicy, OrderLedger, OrderRouter, ReconcileOutcome,
};
