pub mod audit;
pub mod checkout;
pub mod idempotency;
pub mod materializer;
pub mod notifications;
pub mod payments;
pub mod reconciler;
pub mod refunds;
pub mod stock;
