pub mod campaign;
pub mod collaborators;
pub mod ids;
pub mod response;
pub mod snapshot;
