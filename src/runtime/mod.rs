pub mod inbox;
pub mod worker;
