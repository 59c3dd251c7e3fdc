//! latch-core
//!
//! Worker-side client for the external task queue of a process engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, variables, task, outcome）
//! - **ports**: 抽象化レイヤー（EngineGateway, Clock）
//! - **impls**: 実装（RestGateway, InMemoryEngine）
//! - **lease**: 保持中のロックの管理（LeaseTracker）
//! - **handle / handler**: handler に渡す TaskHandle と TaskHandler trait
//! - **retry**: 自動 failure 報告のリトライ方針
//! - **app**: Supervisor と Poller
//! - **config / error**: 設定とエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod handle;
pub mod handler;
pub mod impls;
pub mod lease;
pub mod ports;
pub mod retry;

pub use app::{PollerState, Supervisor, SubscriptionStatus, Topics};
pub use config::{EngineAuth, EngineConfig, SubscriptionConfig, WorkerConfig};
pub use domain::{
    BusinessError, ExternalTask, Failure, Outcome, TaskId, VariableValue, Variables, WorkerId,
};
pub use error::{ErrorKind, LatchError};
pub use handle::TaskHandle;
pub use handler::{HandlerError, HandlerResult, TaskHandler};
pub use impls::{InMemoryEngine, RestGateway};
pub use ports::EngineGateway;
