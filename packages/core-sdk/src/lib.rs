pub mod controller;
pub mod db;
pub mod document;
pub mod extract;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod server;
pub mod telemetry;
pub mod workflow;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::controller::{CancelHandle, Controller};
    pub use crate::db;
    pub use crate::document::Document;
    pub use crate::llm::{self, HttpRelay, RelayTransport};
    pub use crate::models;
    pub use crate::server::{self, RelayConfig};
    pub use crate::telemetry;
    pub use crate::workflow::{self, Msg, Stage, View, WorkflowState};
}
