pub mod bridge;
pub mod transactions;
