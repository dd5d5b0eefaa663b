//! Contact resolution: sender identities shared across channels.

mod model;
mod repository;

pub use model::{Contact, ContactId, NewContact};
pub use repository::ContactRepository;
