pub mod capture;
pub mod cleanup;
pub mod query;
pub mod relay;
