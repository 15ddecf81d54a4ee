pub mod crypto;
pub mod machine_id;
pub mod marker_store;
pub mod password;
