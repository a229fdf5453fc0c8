#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The blessed entry point into the PSP core. Everything a host application
//! needs goes through [`Psp`]: committing payroll batches, executing
//! payments, ingesting settlement feeds, and handling provider callbacks.

mod facade;
mod health;
mod telemetry;

pub use crate::facade::CallbackResult;
pub use crate::facade::CallbackStatus;
pub use crate::facade::CommitResult;
pub use crate::facade::CommitStatus;
pub use crate::facade::ExecutePaymentsRequest;
pub use crate::facade::ExecuteResult;
pub use crate::facade::ExecuteStatus;
pub use crate::facade::ExecutionFailure;
pub use crate::facade::IngestResult;
pub use crate::facade::IngestStatus;
pub use crate::facade::PayrollBatch;
pub use crate::facade::PayrollItem;
pub use crate::facade::Psp;
pub use crate::facade::PspConfig;
pub use crate::facade::PspError;
pub use crate::facade::PspResult;
pub use crate::health::AccountBalanceIssue;
pub use crate::health::DailyHealth;
pub use crate::telemetry::PspTelemetry;
pub use crate::telemetry::TelemetryCounters;
