//! Ledger store entities.

pub mod audit_entry;
pub mod cart;
pub mod cart_line;
pub mod order;
pub mod order_line;
pub mod processed_event;
pub mod product;
pub mod refund;
pub mod variant;

pub use order::{FulfillmentStatus, PaymentStatus};
