pub mod room;
pub mod practitioner;

pub use room::RoomService;
pub use practitioner::PractitionerService;
