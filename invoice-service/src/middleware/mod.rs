mod auth;

pub use auth::{AuthContext, USER_ID_HEADER};
