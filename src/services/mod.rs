pub mod capture;
pub mod decoder;
pub mod encounter;
pub mod reassembly;
pub mod signature;
