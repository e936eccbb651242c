pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod program;
pub mod session;
pub mod shape;
pub mod signature;
pub mod storage;
pub mod synthesis;
pub mod task;
pub mod trace;
pub mod validator;

/// The value type flowing through calls: arguments, results and program literals.
///
/// User-defined record types are objects tagged with [`shape::TYPE_TAG`].
pub type LambdaValue = serde_json::Value;
