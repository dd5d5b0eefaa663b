//! Channel connections: a workspace's credentialed binding to one external account.

mod model;
mod repository;

pub use model::{
    ChannelConnection, ConnectionId, ConnectionStatus, NewConnection, ProviderKind, UserId,
    WorkspaceId,
};
pub use repository::ConnectionRepository;
