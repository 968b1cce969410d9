pub mod conflict;
pub mod intent;
pub mod lease;
pub mod machine;
pub mod model;
pub mod nudge;
pub mod progress;
pub mod release;
pub mod standing;
pub mod store;
