//! Impls - EngineGateway の実装
//!
//! - **RestGateway**: 本番用。エンジンの REST API を叩く
//! - **InMemoryEngine**: 開発・テスト用。エンジンの挙動をメモリ上で再現する

pub mod inmem_engine;
pub mod rest_gateway;

pub use self::inmem_engine::{EngineTaskState, FetchRecord, GatewayCall, InMemoryEngine};
pub use self::rest_gateway::RestGateway;
