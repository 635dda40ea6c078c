//! Wire protocol and domain types shared by the sync engine, the server
//! binary, and the supervisor console client.

pub mod domain;
pub mod error;
pub mod protocol;
