pub mod auth;
pub mod comments;
pub mod forum;
pub mod research;
pub mod users;

pub use auth::auth_routes;
pub use comments::comments_routes;
pub use forum::forum_routes;
pub use research::research_routes;
pub use users::users_routes;
