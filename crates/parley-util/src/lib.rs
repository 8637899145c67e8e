pub mod id_string;
pub mod pagination;
pub mod snowflake;
pub mod validation;
