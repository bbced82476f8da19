pub mod encoder;
pub mod keys;
