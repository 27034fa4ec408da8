//! Domain operations. Each submodule owns one operation family; every
//! operation takes the pool, the request metadata, and the acting principal
//! explicitly — there is no ambient state.

pub mod envs;
pub mod projects;
pub mod rotation;
pub mod service_roles;
pub mod sessions;
pub mod snapshots;
pub mod users;
