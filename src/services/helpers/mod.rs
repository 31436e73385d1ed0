pub mod address;
pub mod backoff;
