pub mod context;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use context::*;
pub use error::*;
pub use models::*;
pub use router::patient_flow_routes;
pub use services::*;
