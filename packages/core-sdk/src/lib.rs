pub mod config;
pub mod credentials;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod improver;
pub mod llm;
pub mod models;
pub mod server;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块与类型。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::credentials::CredentialStore;
    pub use crate::dispatch::{DispatchOutcome, Dispatcher};
    pub use crate::error::{DispatchError, ImproveError};
    pub use crate::improver::PromptImprover;
    pub use crate::llm::ProviderFamily;
    pub use crate::models::{ModelConfig, ModelPatch, NewModel};
    pub use crate::{db, export, server, telemetry};
}
