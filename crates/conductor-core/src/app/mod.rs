//! App - アプリケーション層（Manager, Overlord, バックグラウンドループ）
//!
//! - **Manager**: owns the handlers for a set of task kinds
//! - **OverlordBuilder**: registration and startup validation
//! - **Overlord**: settle (run to quiescence) and the background loop

pub mod builder;
pub mod manager;
pub mod overlord;
mod run_loop;

pub use self::builder::OverlordBuilder;
pub use self::manager::Manager;
pub use self::overlord::Overlord;
