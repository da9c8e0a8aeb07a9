pub mod comment;
pub mod paper;
pub mod post;
pub mod user;

pub use comment::*;
pub use paper::*;
pub use post::*;
pub use user::*;
