pub mod backend;
pub mod collaborators;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod stream;
pub mod tools;
