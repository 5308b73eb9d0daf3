pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod normalize;
pub mod session;
pub mod settings;

pub use config::AuditConfig;
pub use error::AuditError;
pub use model::{
    CaptureInput, CapturedMessage, ChatLog, ChatLogList, ChatSession, ChatSessionList,
    MessageFilter, MessageSource, PlatformBucket, SessionFilter, Stats,
};
pub use normalize::build_chat_messages;
pub use session::{resolve_session_key, strip_session_suffix};
pub use settings::{EnvSettings, SettingsSource, StaticSettings};
