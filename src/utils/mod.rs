pub mod hash;
pub mod retry;
pub mod validation;
