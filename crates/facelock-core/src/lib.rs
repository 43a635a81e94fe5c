pub mod capture;
pub mod errors;
pub mod faces;
pub mod protect;
pub mod unlock;
