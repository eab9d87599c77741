pub mod capture;
pub mod event_log;
pub mod events;
pub mod merge;
pub mod output;
pub mod persistence;
pub mod plan;
pub mod registry;
pub mod supervisor;
pub mod terminal;
pub mod terminate;

pub use capture::{agent_project_dir, capture_session_id, find_session_file, CapturePolicy};
pub use event_log::{EventLogError, JsonlEventLog};
pub use events::EventBus;
pub use merge::{
    MergeCoordinator, MergeError, MergeOutcome, MergePreview, MergeRequest, MergeResult,
    MergeSettings,
};
pub use persistence::{PersistenceError, SqliteStore, TerminalSession};
pub use plan::{PlanError, StatusUpdate, WriteOutcome, WritePolicy};
pub use registry::{ProcessRecord, ProcessRegistry, RegistryError};
pub use supervisor::{LaunchRequest, Supervisor, SupervisorError, SupervisorSettings};
pub use terminal::{CreateTerminal, SessionError, TerminalManager, TerminalSize};
pub use terminate::{exit_code, send_signal, terminate_child, Signal, TerminateError};
