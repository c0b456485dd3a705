//! Identity-linking feature modules.
//!
//! Binds a chat-platform identity to an institutional directory account and a
//! code-hosting account via OAuth-style redirect flows. All chat-platform and
//! membership access goes through the [`ChatGateway`] and [`MemberDirectory`]
//! seams, so the flows stay testable without a live platform.

mod code_host;
mod directory;
mod directory_auth;
mod error;
mod gateway;

pub use code_host::{CodeHostAuthClient, CodeHostAuthConfig, CodeHostLinkService, CodeHostUser};
pub use directory::{MemberDirectory, MemberRecord, StoreBackedDirectory};
pub use directory_auth::{
    DirectoryAuthClient, DirectoryAuthConfig, DirectoryLinkService, DirectoryProfile,
    CALLBACK_APPROVE_ALUMNUS, CALLBACK_APPROVE_GUEST, CALLBACK_REJECT,
};
pub use error::LinkError;
pub use gateway::{ChatGateway, RestChatGateway};

#[derive(Debug, Clone)]
/// Role ids the linking flows grant or require.
pub struct CommunityRoles {
    pub member: String,
    pub alumni: String,
    pub guest: String,
    pub steward: String,
}

/// Renders a user mention in the platform's message markup.
pub fn mention(user_id: &str) -> String {
    format!("<@{user_id}>")
}

#[cfg(test)]
mod tests;
