pub mod attachments;
pub mod auth_routes;
pub mod messages;
pub mod presence;
pub mod users;
