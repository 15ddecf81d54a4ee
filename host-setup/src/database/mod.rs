pub mod connection;
pub mod provisioning;
pub mod users;

#[cfg(test)]
pub(crate) mod fake;
