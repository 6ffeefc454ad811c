pub mod assignment;
pub mod audit;
pub mod catalog;
pub mod check_in;
pub mod engine;
pub mod eta;
pub mod events;
pub mod lifecycle;
pub mod notifier;
pub mod pause;
pub mod snapshot;
pub mod sweeper;
pub mod worker;

pub use audit::{AuditSink, SupabaseAuditSink, TracingAuditSink};
pub use catalog::{InMemoryServiceCatalog, ServiceCatalog, SupabaseServiceCatalog};
pub use engine::PatientFlowEngine;
pub use events::{EventBus, RedisEventRelay};
pub use notifier::{HttpNotifier, LogNotifier, Notifier};
pub use pause::{InMemoryPauseFlags, PauseFlags, RedisPauseFlags};
pub use worker::{SweepReport, SweepWorker};
