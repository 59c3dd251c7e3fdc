//! App - アプリケーション層
//!
//! ports を組み合わせてワーカーを動かす。
//!
//! # 主要コンポーネント
//! - **Supervisor**: サブスクリプションの登録・停止・ステータス
//! - **Poller**: fetch-and-lock → dispatch → sleep のループ
//! - **Status**: Poller の状態とサブスクリプションのスナップショット

pub mod poller;
pub mod status;
pub mod supervisor;

// 主要な型を再エクスポート
pub use self::poller::{Poller, Subscription};
pub use self::status::{PollerState, SubscriptionStatus};
pub use self::supervisor::{Supervisor, Topics};
