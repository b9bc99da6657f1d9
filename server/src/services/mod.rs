// server/src/services/mod.rs

pub mod invoices;
pub mod notifications;

pub use invoices::InvoiceSequence;
pub use notifications::LoggingNotifications;
